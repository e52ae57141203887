use std::sync::Arc;

use super::object::Proxy;
use super::repository::ProxyRepository;
use crate::error::{Error, ErrorKind, Result, StoreError};
use crate::events::InstanceEventManager;
use crate::object::{CimInstance, ObjectKey};
use crate::store::InstanceStore;

/// Resolves keys to the single live [`Proxy`] of each remote object.
pub struct ProxyFactory {
    store: Arc<dyn InstanceStore>,
    repository: Arc<ProxyRepository>,
    events: Arc<InstanceEventManager>,
}

impl ProxyFactory {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        repository: Arc<ProxyRepository>,
        events: Arc<InstanceEventManager>,
    ) -> Self {
        Self {
            store,
            repository,
            events,
        }
    }

    pub fn repository(&self) -> &Arc<ProxyRepository> {
        &self.repository
    }

    /// Existing proxy for `key`, or a new one.
    ///
    /// A new proxy is populated from `seed` when given, otherwise fetched.
    /// If the object turns out to be of a subclass, the proxy is keyed by
    /// the concrete class and `key` becomes an alias of it. A key seen deleted fails with `ObjectNotFound`
    /// unless a seed shows the object exists again.
    pub fn get_or_create(&self, key: &ObjectKey, seed: Option<CimInstance>) -> Result<Arc<Proxy>> {
        if seed.is_some() {
            self.repository.lift_tombstone(key);
        } else if self.repository.is_tombstoned(key) {
            return Err(Error::object_not_found(key.path()));
        }
        if let Some(existing) = self.repository.get(key) {
            return Ok(existing);
        }

        let instance = match seed {
            Some(instance) => instance,
            None => self.fetch(key)?,
        };
        let concrete = concrete_key(key, &instance)?;
        let proxy = match self.repository.get(&concrete) {
            Some(existing) => existing,
            None => {
                let proxy = self.build(concrete);
                proxy.replace_from_instance(instance);
                self.repository.register(proxy)
            }
        };
        self.repository.register_alias(key, proxy.key());
        Ok(proxy)
    }

    /// Existing proxy for `key`, or a new one that fetches on first use.
    pub fn get_or_create_delayed(&self, key: &ObjectKey) -> Result<Arc<Proxy>> {
        if self.repository.is_tombstoned(key) {
            return Err(Error::object_not_found(key.path()));
        }
        if let Some(existing) = self.repository.get(key) {
            return Ok(existing);
        }
        Ok(self.repository.register(self.build(key.clone())))
    }

    /// Non-creating lookup. With `check_remote`, a miss falls back to a
    /// remote fetch and a gone object yields `None`.
    pub fn try_get_existing(&self, key: &ObjectKey, check_remote: bool) -> Result<Option<Arc<Proxy>>> {
        if let Some(existing) = self.repository.get(key) {
            return Ok(Some(existing));
        }
        if !check_remote {
            return Ok(None);
        }
        match self.get_or_create(key, None) {
            Ok(proxy) => Ok(Some(proxy)),
            Err(e) if e.kind() == ErrorKind::ObjectNotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn build(&self, key: ObjectKey) -> Arc<Proxy> {
        Arc::new(Proxy::new(
            key,
            Arc::clone(&self.store),
            Arc::clone(&self.events),
            Arc::downgrade(&self.repository),
        ))
    }

    fn fetch(&self, key: &ObjectKey) -> Result<CimInstance> {
        tracing::debug!(path = %key, "fetching instance for new proxy");
        self.store.get_instance(key.path()).map_err(|e| {
            if matches!(e, StoreError::NotFound { .. }) {
                self.repository.remove_deleted(key);
            }
            Error::from_store(e, key.path())
        })
    }
}

/// Key under the instance's own class when it differs from the requested one.
fn concrete_key(key: &ObjectKey, instance: &CimInstance) -> Result<ObjectKey> {
    if instance.class_name().eq_ignore_ascii_case(key.class_name()) {
        return Ok(key.clone());
    }
    tracing::debug!(
        path = %key,
        class = instance.class_name(),
        "re-keying proxy under concrete class"
    );
    ObjectKey::new(key.path().clone().with_class(instance.class_name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, EventConfig};
    use crate::store::{MemoryStore, StoreCall};

    const NS: &str = r"root\virtualization\v2";

    fn setup() -> (ProxyFactory, MemoryStore) {
        let store = MemoryStore::new("HOST1");
        let shared: Arc<dyn InstanceStore> = Arc::new(store.clone());
        let events = Arc::new(InstanceEventManager::new(Arc::clone(&shared), EventConfig::default()));
        let repository = ProxyRepository::new(&CacheConfig::default());
        (ProxyFactory::new(shared, repository, events), store)
    }

    fn vm(name: &str) -> CimInstance {
        CimInstance::new("Msvm_ComputerSystem")
            .with_key("CreationClassName", "Msvm_ComputerSystem")
            .with_key("Name", name)
            .with_property("ElementName", "web01")
    }

    #[test]
    fn test_seeded_proxy_skips_fetch() {
        let (factory, store) = setup();
        let path = store.insert(NS, vm("A")).unwrap();
        let key = ObjectKey::new(path).unwrap();
        let proxy = factory.get_or_create(&key, Some(vm("A"))).unwrap();
        assert_eq!(
            proxy.get_property("ElementName").unwrap().as_str(),
            Some("web01")
        );
        assert_eq!(store.call_count(StoreCall::GetInstance), 0);
    }

    #[test]
    fn test_missing_object_is_tombstoned() {
        let (factory, store) = setup();
        let key = ObjectKey::new(
            crate::object::WmiObjectPath::new("HOST1", NS, "Msvm_ComputerSystem")
                .with_key("Name", "missing"),
        )
        .unwrap();
        let err = factory.get_or_create(&key, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ObjectNotFound);
        let err = factory.get_or_create(&key, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ObjectNotFound);
        assert_eq!(store.call_count(StoreCall::GetInstance), 1);
        assert!(factory.try_get_existing(&key, true).unwrap().is_none());
    }

    #[test]
    fn test_subclass_is_rekeyed() {
        let (factory, store) = setup();
        store.declare_subclass("Msvm_ComputerSystem", "CIM_ComputerSystem");
        let path = store.insert(NS, vm("A")).unwrap();
        let base = ObjectKey::new(path.clone().with_class("CIM_ComputerSystem")).unwrap();

        let proxy = factory.get_or_create(&base, None).unwrap();
        assert_eq!(proxy.key().class_name(), "Msvm_ComputerSystem");
        let concrete = ObjectKey::new(path).unwrap();
        let again = factory.get_or_create(&concrete, None).unwrap();
        assert!(Arc::ptr_eq(&proxy, &again));

        let through_base = factory.get_or_create(&base, None).unwrap();
        assert!(Arc::ptr_eq(&proxy, &through_base));
        assert_eq!(store.call_count(StoreCall::GetInstance), 1);
    }

    #[test]
    fn test_try_get_existing_without_remote() {
        let (factory, store) = setup();
        let path = store.insert(NS, vm("A")).unwrap();
        let key = ObjectKey::new(path).unwrap();
        assert!(factory.try_get_existing(&key, false).unwrap().is_none());
        assert_eq!(store.call_count(StoreCall::GetInstance), 0);
        assert!(factory.try_get_existing(&key, true).unwrap().is_some());
        assert!(factory.try_get_existing(&key, false).unwrap().is_some());
    }

    #[test]
    fn test_delayed_proxy_fetches_on_first_read() {
        let (factory, store) = setup();
        let path = store.insert(NS, vm("A")).unwrap();
        let key = ObjectKey::new(path).unwrap();
        let proxy = factory.get_or_create_delayed(&key).unwrap();
        assert_eq!(store.call_count(StoreCall::GetInstance), 0);
        assert!(proxy.does_property_exist("ElementName").unwrap());
        assert_eq!(store.call_count(StoreCall::GetInstance), 1);
    }
}
