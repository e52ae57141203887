//! Per-connection context.
//!
//! A [`Server`] owns everything that must not be shared between two
//! connections: the proxy repository and factory, the event manager, the
//! association catalogue and the view registry.

use core::fmt;
use std::sync::Arc;

use crate::association::Associations;
use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::events::InstanceEventManager;
use crate::object::{ObjectKey, WmiObjectPath};
use crate::proxy::{Proxy, ProxyFactory, ProxyRepository};
use crate::store::InstanceStore;
use crate::task::{JobTask, JobWaitConfig, Task};
use crate::view::{ManagementObject, TypedView, View, ViewRegistry};

/// Namespace used for paths that do not name one.
pub const DEFAULT_NAMESPACE: &str = r"root\virtualization\v2";

pub struct Server {
    store: Arc<dyn InstanceStore>,
    config: Config,
    repository: Arc<ProxyRepository>,
    events: Arc<InstanceEventManager>,
    factory: ProxyFactory,
    associations: Associations,
    registry: ViewRegistry,
}

impl Server {
    pub fn new(store: Arc<dyn InstanceStore>, config: Config, registry: ViewRegistry) -> Arc<Self> {
        let repository = ProxyRepository::new(&config.cache);
        let events = Arc::new(InstanceEventManager::new(
            Arc::clone(&store),
            config.events.clone(),
        ));
        let factory = ProxyFactory::new(
            Arc::clone(&store),
            Arc::clone(&repository),
            Arc::clone(&events),
        );
        if config.cache.sweep_enabled {
            repository.start_sweeper(config.cache.sweep_interval());
        }
        tracing::info!(
            server = store.server_name(),
            views = registry.len(),
            "connected"
        );
        Arc::new(Self {
            store,
            config,
            repository,
            events,
            factory,
            associations: Associations::new(),
            registry,
        })
    }

    /// Default configuration and the built-in views.
    ///
    /// Fails only if the built-in views register a class twice.
    pub fn with_defaults(store: Arc<dyn InstanceStore>) -> Result<Arc<Self>> {
        let registry = ViewRegistry::builder().with_builtin_views().build()?;
        Ok(Self::new(store, Config::default(), registry))
    }

    pub fn server_name(&self) -> &str {
        self.store.server_name()
    }

    /// Key for `path`, filling in this server and the default namespace
    /// where the path leaves them out.
    pub fn object_key(&self, path: &WmiObjectPath) -> Result<ObjectKey> {
        let mut path = path.clone();
        if path.server().is_empty() {
            path = path.with_server(self.server_name());
        }
        if path.namespace().is_empty() {
            path = path.with_namespace(DEFAULT_NAMESPACE);
        }
        ObjectKey::new(path)
    }

    /// Object at `key`, wrapped in the view registered for its class.
    pub fn get_object(self: &Arc<Self>, key: &ObjectKey) -> Result<Box<dyn ManagementObject>> {
        let proxy = self.factory.get_or_create(key, None)?;
        Ok(self.registry.create(View::new(Arc::clone(self), proxy)))
    }

    /// Object at `key` as a `T`.
    ///
    /// Fails with `InvalidKey` when the object's class is registered to a
    /// different view type.
    pub fn get_view<T: TypedView>(self: &Arc<Self>, key: &ObjectKey) -> Result<T> {
        let proxy = self.factory.get_or_create(key, None)?;
        self.typed(proxy)
    }

    /// Like [`get_view`](Self::get_view), but an object that no longer
    /// exists yields `None`.
    pub fn try_get_view<T: TypedView>(self: &Arc<Self>, key: &ObjectKey) -> Result<Option<T>> {
        match self.factory.try_get_existing(key, true)? {
            Some(proxy) if proxy.is_deleted() => Ok(None),
            Some(proxy) => match self.typed(proxy) {
                Ok(view) => Ok(Some(view)),
                Err(e) if e.kind() == ErrorKind::ObjectNotFound => Ok(None),
                Err(e) => Err(e),
            },
            None => Ok(None),
        }
    }

    /// Every instance of `T`'s class in the default namespace.
    ///
    /// Proxies are seeded from the enumeration, so no per-object fetch
    /// follows. Proxies already cached take the enumerated properties.
    pub fn enumerate<T: TypedView>(self: &Arc<Self>) -> Result<Vec<T>> {
        self.enumerate_in::<T>(DEFAULT_NAMESPACE)
    }

    pub fn enumerate_in<T: TypedView>(self: &Arc<Self>, namespace: &str) -> Result<Vec<T>> {
        tracing::debug!(namespace, class = T::CLASS_NAME, "enumerating instances");
        let instances = self
            .store
            .enumerate_instances(namespace, T::CLASS_NAME)
            .map_err(|e| Error::from_store_on(self.server_name(), e))?;

        let mut views = Vec::with_capacity(instances.len());
        for instance in instances {
            let key = ObjectKey::from_instance(self.server_name(), namespace, &instance)?;
            let proxy = match self.repository.get(&key) {
                Some(existing) => {
                    existing.replace_from_instance(instance);
                    existing
                }
                None => self.factory.get_or_create(&key, Some(instance))?,
            };
            views.push(self.typed(proxy)?);
        }
        Ok(views)
    }

    /// Follow the job at `path` as a task.
    pub fn task_from_path(&self, path: &WmiObjectPath) -> Result<Task> {
        let key = self.object_key(path)?;
        let proxy = self.factory.get_or_create(&key, None)?;
        let wait_config = JobWaitConfig {
            timeout: self.config.jobs.timeout(),
            poll_interval: self.config.jobs.poll_interval(),
        };
        let job = JobTask::new(proxy, wait_config, self.associations.affected_job_element.clone())?;
        Ok(job.into())
    }

    fn typed<T: TypedView>(self: &Arc<Self>, proxy: Arc<Proxy>) -> Result<T> {
        let view = View::new(Arc::clone(self), proxy);
        // A concrete class nobody registered is still a `T`: it was fetched
        // through a key of `T`'s class or one of its subclasses.
        if !self.registry.is_registered(view.class_name()) {
            return Ok(T::from_view(view));
        }
        let key = view.key().clone();
        self.registry
            .create(view)
            .into_any()
            .downcast::<T>()
            .map(|typed| *typed)
            .map_err(|_| {
                Error::invalid_key(
                    key.class_name(),
                    format!("'{key}' does not resolve to a {} view", T::CLASS_NAME),
                )
            })
    }

    pub fn associations(&self) -> &Associations {
        &self.associations
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    pub fn repository(&self) -> &Arc<ProxyRepository> {
        &self.repository
    }

    pub fn factory(&self) -> &ProxyFactory {
        &self.factory
    }

    pub fn events(&self) -> &Arc<InstanceEventManager> {
        &self.events
    }

    pub fn registry(&self) -> &ViewRegistry {
        &self.registry
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("server", &self.server_name())
            .field("proxies", &self.repository.len())
            .field("views", &self.registry.len())
            .finish()
    }
}
