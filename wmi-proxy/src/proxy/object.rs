use core::fmt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use super::cache::{AssociationCache, PropertyCache};
use super::repository::ProxyRepository;
use crate::association::Association;
use crate::error::{ClassMember, Error, Result, StoreError};
use crate::events::{EventHandler, HandlerId, InstanceEventManager};
use crate::object::{CimInstance, CimValue, ObjectKey, PropertyMap};
use crate::store::{InstanceEvent, InstanceEventKind, InstanceStore, MethodResult};

/// Observer of proxy lifecycle notifications.
pub type ProxyCallback = Arc<dyn Fn(&ObjectKey) + Send + Sync>;

/// Token returned when adding a proxy observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
struct Observers {
    deleted: Vec<(ObserverId, ProxyCallback)>,
    cache_updated: Vec<(ObserverId, ProxyCallback)>,
    next_id: u64,
    deletion_watch: Option<HandlerId>,
    modification_watch: Option<HandlerId>,
}

impl Observers {
    fn next(&mut self) -> ObserverId {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        id
    }
}

/// Cache entry for one remote object.
///
/// Obtained through [`ProxyFactory`](super::ProxyFactory), which guarantees a
/// single live proxy per [`ObjectKey`]. No lock is held across a remote call.
pub struct Proxy {
    key: ObjectKey,
    store: Arc<dyn InstanceStore>,
    events: Arc<InstanceEventManager>,
    repository: Weak<ProxyRepository>,
    properties: PropertyCache,
    associations: AssociationCache,
    deleted: AtomicBool,
    observers: Mutex<Observers>,
}

impl Proxy {
    pub(crate) fn new(
        key: ObjectKey,
        store: Arc<dyn InstanceStore>,
        events: Arc<InstanceEventManager>,
        repository: Weak<ProxyRepository>,
    ) -> Self {
        Self {
            key,
            store,
            events,
            repository,
            properties: PropertyCache::default(),
            associations: AssociationCache::default(),
            deleted: AtomicBool::new(false),
            observers: Mutex::new(Observers::default()),
        }
    }

    fn observers(&self) -> MutexGuard<'_, Observers> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_deleted() {
            return Err(Error::object_not_found(self.key.path()));
        }
        Ok(())
    }

    /// Map a store failure, marking the proxy deleted on not-found.
    fn store_error(&self, err: StoreError) -> Error {
        if matches!(err, StoreError::NotFound { .. }) {
            self.mark_deleted();
        }
        Error::from_store(err, self.key.path())
    }

    fn fetch(&self) -> Result<()> {
        self.ensure_alive()?;
        tracing::debug!(path = %self.key, "fetching instance");
        let instance = self
            .store
            .get_instance(self.key.path())
            .map_err(|e| self.store_error(e))?;
        self.replace_from_instance(instance);
        Ok(())
    }

    /// Replace the property cache with `instance`'s properties.
    pub(crate) fn replace_from_instance(&self, instance: CimInstance) {
        self.properties.replace(instance.into_properties());
        self.raise_cache_updated();
    }

    /// Current property snapshot, fetched on first use.
    pub fn properties(&self) -> Result<Arc<PropertyMap>> {
        self.ensure_alive()?;
        if let Some(properties) = self.properties.get() {
            return Ok(properties);
        }
        self.fetch()?;
        self.properties
            .get()
            .ok_or_else(|| Error::object_not_found(self.key.path()))
    }

    pub fn get_property(&self, name: &str) -> Result<CimValue> {
        self.properties()?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ClassDefinitionMismatch {
                class_name: self.key.class_name().to_string(),
                member: ClassMember::Property,
                name: name.to_string(),
            })
    }

    pub fn does_property_exist(&self, name: &str) -> Result<bool> {
        Ok(self.properties()?.contains(name))
    }

    pub fn property_names(&self) -> Result<Vec<String>> {
        Ok(self.properties()?.names().map(str::to_string).collect())
    }

    /// True when the property cache is empty or at least `threshold` old.
    pub fn needs_update(&self, threshold: Duration) -> bool {
        self.properties.is_stale(threshold)
    }

    /// Re-fetch all properties when the cache is older than `threshold`.
    /// A zero threshold always fetches.
    pub fn update_property_cache(&self, threshold: Duration) -> Result<()> {
        self.ensure_alive()?;
        if self.needs_update(threshold) {
            self.fetch()?;
        }
        Ok(())
    }

    /// Merge a partial property map into the cache and notify observers.
    ///
    /// An unloaded cache stays unloaded; observers are notified either way.
    pub fn update_property_cache_from(&self, changes: &PropertyMap) {
        if self.is_deleted() {
            return;
        }
        self.properties.merge(changes);
        self.raise_cache_updated();
    }

    pub fn invalidate_property_cache(&self) {
        self.properties.invalidate();
    }

    pub fn invalidate_association_cache(&self) {
        self.associations.invalidate();
    }

    /// Write `changes` to the remote object and merge what the server
    /// confirmed. Returns the confirmed values of the written properties.
    ///
    /// The cache is left untouched on failure.
    pub fn put_properties(&self, changes: &PropertyMap) -> Result<PropertyMap> {
        self.ensure_alive()?;
        tracing::info!(
            path = %self.key,
            properties = %serde_json::to_string(changes).unwrap_or_default(),
            "modifying instance"
        );
        let confirmed = self
            .store
            .modify_instance(self.key.path(), changes)
            .map_err(|e| self.store_error(e))?;

        let merged: PropertyMap = changes
            .iter()
            .map(|(name, sent)| {
                let value = confirmed.property(name).cloned().unwrap_or_else(|| sent.clone());
                (name, value)
            })
            .collect();
        self.update_property_cache_from(&merged);
        Ok(merged)
    }

    /// Keys of objects related through `association`.
    ///
    /// Served from the association cache when the entry is younger than
    /// `max_age`; pass `Duration::MAX` to accept any cached entry.
    pub fn get_related_object_keys(
        &self,
        association: &Association,
        max_age: Duration,
    ) -> Result<Vec<ObjectKey>> {
        self.ensure_alive()?;
        if let Some(keys) = self.associations.get_fresh(association, max_age) {
            return Ok(keys.as_ref().clone());
        }
        Ok(self.fetch_association(association)?.as_ref().clone())
    }

    fn fetch_association(&self, association: &Association) -> Result<Arc<Vec<ObjectKey>>> {
        tracing::debug!(path = %self.key, association = %association, "enumerating related objects");
        let instances = self
            .store
            .enumerate_associated_instances(self.key.path(), association)
            .map_err(|e| self.store_error(e))?;

        let mut seen = HashSet::new();
        let mut keys = Vec::with_capacity(instances.len());
        for instance in &instances {
            let key = ObjectKey::from_instance(self.key.server(), self.key.namespace(), instance)?;
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }
        Ok(self.associations.insert(association.clone(), keys))
    }

    /// Refresh every cached association older than `threshold`, except
    /// those in `exclude` or flagged as not bulk-updatable.
    pub fn update_association_cache(
        &self,
        threshold: Duration,
        exclude: &[Association],
    ) -> Result<()> {
        self.ensure_alive()?;
        for association in self.associations.associations() {
            if association.skips_bulk_update() || exclude.contains(&association) {
                continue;
            }
            if self.associations.get_fresh(&association, threshold).is_none() {
                self.fetch_association(&association)?;
            }
        }
        Ok(())
    }

    /// Refresh one association when its entry is missing or older than `threshold`.
    pub fn update_one_cached_association(
        &self,
        association: &Association,
        threshold: Duration,
    ) -> Result<()> {
        self.ensure_alive()?;
        if self.associations.get_fresh(association, threshold).is_none() {
            self.fetch_association(association)?;
        }
        Ok(())
    }

    pub fn invoke_method(&self, method: &str, args: &PropertyMap) -> Result<MethodResult> {
        self.ensure_alive()?;
        tracing::debug!(path = %self.key, method, "invoking method");
        let result = self
            .store
            .invoke_method(self.key.path(), method, args)
            .map_err(|e| self.store_error(e))?;
        tracing::debug!(path = %self.key, method, return_value = result.return_value, "method returned");
        Ok(result)
    }

    /// Mark the remote object gone. Fires `Deleted` and evicts the proxy the
    /// first time; later calls return false.
    pub(crate) fn mark_deleted(&self) -> bool {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::info!(path = %self.key, "remote object deleted");
        self.properties.invalidate();
        self.associations.invalidate();

        let (callbacks, watches) = {
            let mut obs = self.observers();
            let callbacks: Vec<_> = obs.deleted.iter().map(|(_, cb)| Arc::clone(cb)).collect();
            (callbacks, (obs.deletion_watch.take(), obs.modification_watch.take()))
        };
        self.drop_watches(watches);
        if let Some(repository) = self.repository.upgrade() {
            repository.remove_deleted(&self.key);
        }
        for callback in callbacks {
            callback(&self.key);
        }
        true
    }

    fn drop_watches(&self, (deletion, modification): (Option<HandlerId>, Option<HandlerId>)) {
        if let Some(id) = deletion {
            self.events
                .unregister(&self.key, InstanceEventKind::Deletion, id);
        }
        if let Some(id) = modification {
            self.events
                .unregister(&self.key, InstanceEventKind::Modification, id);
        }
    }

    fn raise_cache_updated(&self) {
        let callbacks: Vec<_> = self
            .observers()
            .cache_updated
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(&self.key);
        }
    }

    /// Observe deletion. The first observer starts a deletion-event watch.
    pub fn on_deleted(self: &Arc<Self>, callback: ProxyCallback) -> Result<ObserverId> {
        let (id, needs_watch) = {
            let mut obs = self.observers();
            let id = obs.next();
            obs.deleted.push((id, callback));
            (id, obs.deletion_watch.is_none())
        };
        if needs_watch && !self.is_deleted() {
            let weak = Arc::downgrade(self);
            let handler: EventHandler = Arc::new(move |_: &InstanceEvent| {
                if let Some(proxy) = weak.upgrade() {
                    proxy.mark_deleted();
                }
            });
            match self
                .events
                .register(&self.key, InstanceEventKind::Deletion, handler)
            {
                Ok(handler_id) => {
                    let extra = {
                        let mut obs = self.observers();
                        if obs.deletion_watch.is_none() && !self.is_deleted() {
                            obs.deletion_watch = Some(handler_id);
                            None
                        } else {
                            Some(handler_id)
                        }
                    };
                    self.drop_watches((extra, None));
                }
                Err(e) => {
                    self.observers().deleted.retain(|(i, _)| *i != id);
                    return Err(e);
                }
            }
        }
        Ok(id)
    }

    /// Remove a deletion observer; the last one stops the deletion watch.
    pub fn remove_deleted_handler(&self, id: ObserverId) -> bool {
        let (removed, watch) = {
            let mut obs = self.observers();
            let before = obs.deleted.len();
            obs.deleted.retain(|(i, _)| *i != id);
            let removed = obs.deleted.len() != before;
            let watch = if obs.deleted.is_empty() {
                obs.deletion_watch.take()
            } else {
                None
            };
            (removed, watch)
        };
        self.drop_watches((watch, None));
        removed
    }

    pub fn on_property_cache_updated(&self, callback: ProxyCallback) -> ObserverId {
        let mut obs = self.observers();
        let id = obs.next();
        obs.cache_updated.push((id, callback));
        id
    }

    pub fn remove_cache_updated_handler(&self, id: ObserverId) -> bool {
        let mut obs = self.observers();
        let before = obs.cache_updated.len();
        obs.cache_updated.retain(|(i, _)| *i != id);
        obs.cache_updated.len() != before
    }

    /// Keep the property cache current from modification events.
    pub fn watch_modifications(self: &Arc<Self>) -> Result<()> {
        self.ensure_alive()?;
        if self.observers().modification_watch.is_some() {
            return Ok(());
        }
        let weak = Arc::downgrade(self);
        let handler: EventHandler = Arc::new(move |event: &InstanceEvent| {
            if let Some(proxy) = weak.upgrade() {
                if !proxy.is_deleted() {
                    tracing::trace!(path = %proxy.key, "applying modification event");
                    proxy.replace_from_instance(event.target.clone());
                }
            }
        });
        let handler_id = self
            .events
            .register(&self.key, InstanceEventKind::Modification, handler)?;
        let extra = {
            let mut obs = self.observers();
            if obs.modification_watch.is_none() {
                obs.modification_watch = Some(handler_id);
                None
            } else {
                Some(handler_id)
            }
        };
        self.drop_watches((None, extra));
        Ok(())
    }

    pub fn unwatch_modifications(&self) {
        let watch = self.observers().modification_watch.take();
        self.drop_watches((None, watch));
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        let obs = self.observers.get_mut().unwrap_or_else(PoisonError::into_inner);
        let watches = (obs.deletion_watch.take(), obs.modification_watch.take());
        self.drop_watches(watches);
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("key", &self.key)
            .field("deleted", &self.is_deleted())
            .finish_non_exhaustive()
    }
}
