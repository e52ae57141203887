use core::fmt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::monitor::{EventHandler, HandlerId, InstanceEventBulkMonitor};
use crate::config::EventConfig;
use crate::error::Result;
use crate::object::{fold, ObjectKey};
use crate::store::{EventQuery, InstanceEventKind, InstanceStore};

/// Identifies one bulk monitor: server, namespace, class and event kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventMonitorKey {
    server: String,
    namespace: String,
    class_name: String,
    kind: InstanceEventKind,
}

impl EventMonitorKey {
    pub fn new(server: &str, namespace: &str, class_name: &str, kind: InstanceEventKind) -> Self {
        Self {
            server: fold(server),
            namespace: fold(namespace),
            class_name: fold(class_name),
            kind,
        }
    }

    pub fn for_object(key: &ObjectKey, kind: InstanceEventKind) -> Self {
        Self::new(key.server(), key.namespace(), key.class_name(), kind)
    }

    pub fn kind(&self) -> InstanceEventKind {
        self.kind
    }
}

impl fmt::Display for EventMonitorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} ({})",
            self.server, self.namespace, self.class_name, self.kind
        )
    }
}

/// Hands out one [`InstanceEventBulkMonitor`] per [`EventMonitorKey`].
///
/// Monitors are created on first use and kept; an idle monitor holds no
/// subscription.
pub struct InstanceEventManager {
    store: Arc<dyn InstanceStore>,
    config: EventConfig,
    monitors: Mutex<HashMap<EventMonitorKey, Arc<InstanceEventBulkMonitor>>>,
}

impl InstanceEventManager {
    pub fn new(store: Arc<dyn InstanceStore>, config: EventConfig) -> Self {
        Self {
            store,
            config,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Monitor for `key`'s class and `kind`, created on first request.
    pub fn monitor(&self, key: &ObjectKey, kind: InstanceEventKind) -> Arc<InstanceEventBulkMonitor> {
        let monitor_key = EventMonitorKey::for_object(key, kind);
        let mut monitors = self.monitors.lock().unwrap_or_else(PoisonError::into_inner);
        let monitor = monitors.entry(monitor_key).or_insert_with_key(|mk| {
            tracing::debug!(monitor = %mk, "creating instance event monitor");
            InstanceEventBulkMonitor::new(
                Arc::clone(&self.store),
                key.namespace(),
                EventQuery::new(kind, key.class_name(), self.config.polling_interval()),
                self.config.missed_event_window(),
            )
        });
        Arc::clone(monitor)
    }

    /// Register `handler` for `kind` events on `key`.
    ///
    /// A class key receives every event of its class.
    pub fn register(
        &self,
        key: &ObjectKey,
        kind: InstanceEventKind,
        handler: EventHandler,
    ) -> Result<HandlerId> {
        self.monitor(key, kind).register(key.clone(), handler)
    }

    pub fn unregister(&self, key: &ObjectKey, kind: InstanceEventKind, id: HandlerId) -> bool {
        let monitor = self
            .monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&EventMonitorKey::for_object(key, kind))
            .cloned();
        monitor.is_some_and(|m| m.unregister(key, id))
    }

    /// Number of monitors that currently hold a subscription.
    pub fn active_subscriptions(&self) -> usize {
        self.monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|m| m.is_subscribed())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::CimInstance;
    use crate::store::{InstanceEvent, MemoryStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const NS: &str = r"root\virtualization\v2";

    #[test]
    fn test_monitor_key_is_case_insensitive() {
        let a = EventMonitorKey::new("HOST1", NS, "Msvm_ComputerSystem", InstanceEventKind::Deletion);
        let b = EventMonitorKey::new("host1", &NS.to_uppercase(), "msvm_computersystem", InstanceEventKind::Deletion);
        assert_eq!(a, b);
        assert_ne!(
            a,
            EventMonitorKey::new("HOST1", NS, "Msvm_ComputerSystem", InstanceEventKind::Modification)
        );
    }

    #[test]
    fn test_one_monitor_per_class_and_kind() {
        let store = MemoryStore::new("HOST1");
        let mut paths = Vec::new();
        for name in ["A", "B", "C"] {
            let vm = CimInstance::new("Msvm_ComputerSystem")
                .with_key("CreationClassName", "Msvm_ComputerSystem")
                .with_key("Name", name);
            paths.push(store.insert(NS, vm).unwrap());
        }
        let manager = InstanceEventManager::new(Arc::new(store.clone()), EventConfig::default());
        let deleted = Arc::new(AtomicUsize::new(0));

        let mut ids = Vec::new();
        for path in &paths {
            let key = ObjectKey::new(path.clone()).unwrap();
            let d = Arc::clone(&deleted);
            let id = manager
                .register(
                    &key,
                    InstanceEventKind::Deletion,
                    Arc::new(move |_: &InstanceEvent| {
                        d.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .unwrap();
            ids.push((key, id));
        }
        assert_eq!(store.subscription_count(), 1);
        assert_eq!(manager.active_subscriptions(), 1);

        store.remove(&paths[1]);
        assert_eq!(deleted.load(Ordering::SeqCst), 1);

        for (key, id) in &ids {
            assert!(manager.unregister(key, InstanceEventKind::Deletion, *id));
        }
        assert_eq!(manager.active_subscriptions(), 0);
        assert_eq!(store.subscription_count(), 0);
    }
}
