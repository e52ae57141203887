//! Identity-preserving cache of remote objects.

mod cache;
mod factory;
mod object;
mod repository;

pub use factory::ProxyFactory;
pub use object::{ObserverId, Proxy, ProxyCallback};
pub use repository::{ProxyRepository, SweepStats};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::Association;
    use crate::config::{CacheConfig, EventConfig};
    use crate::error::{ErrorKind, FailureReason, StoreError};
    use crate::events::InstanceEventManager;
    use crate::object::{CimInstance, CimValue, ObjectKey, PropertyMap};
    use crate::store::{InstanceStore, MemoryStore, MethodResult, StoreCall};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const NS: &str = r"root\virtualization\v2";

    struct Fixture {
        store: MemoryStore,
        factory: ProxyFactory,
        events: Arc<InstanceEventManager>,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new("HOST1");
        let shared: Arc<dyn InstanceStore> = Arc::new(store.clone());
        let events = Arc::new(InstanceEventManager::new(
            Arc::clone(&shared),
            EventConfig::default(),
        ));
        let repository = ProxyRepository::new(&CacheConfig::default());
        Fixture {
            factory: ProxyFactory::new(shared, repository, Arc::clone(&events)),
            store,
            events,
        }
    }

    fn vm(name: &str) -> CimInstance {
        CimInstance::new("Msvm_ComputerSystem")
            .with_key("CreationClassName", "Msvm_ComputerSystem")
            .with_key("Name", name)
            .with_property("ElementName", "web01")
            .with_property("EnabledState", 2u16)
    }

    fn load(f: &Fixture, name: &str) -> Arc<Proxy> {
        let path = f.store.insert(NS, vm(name)).unwrap();
        f.factory
            .get_or_create(&ObjectKey::new(path).unwrap(), None)
            .unwrap()
    }

    #[test]
    fn test_update_property_cache_respects_threshold() {
        let f = fixture();
        let proxy = load(&f, "A");
        assert_eq!(f.store.call_count(StoreCall::GetInstance), 1);

        proxy.update_property_cache(Duration::from_secs(60)).unwrap();
        assert_eq!(f.store.call_count(StoreCall::GetInstance), 1);

        f.store
            .set_property(proxy.key().path(), "ElementName", "web02")
            .unwrap();
        proxy.update_property_cache(Duration::ZERO).unwrap();
        assert_eq!(f.store.call_count(StoreCall::GetInstance), 2);
        assert_eq!(
            proxy.get_property("ElementName").unwrap(),
            CimValue::from("web02")
        );
    }

    #[test]
    fn test_missing_property_is_class_mismatch() {
        let f = fixture();
        let proxy = load(&f, "A");
        let err = proxy.get_property("NoSuchProperty").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClassDefinitionMismatch);
        assert!(!proxy.does_property_exist("NoSuchProperty").unwrap());
    }

    #[test]
    fn test_transient_failure_keeps_cache() {
        let f = fixture();
        let proxy = load(&f, "A");
        f.store.fail_next(
            StoreCall::GetInstance,
            StoreError::call_failed(FailureReason::RpcServerUnavailable, "unreachable"),
        );
        let err = proxy.update_property_cache(Duration::ZERO).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteCallFailed);
        assert!(!proxy.is_deleted());
        assert_eq!(
            proxy.get_property("ElementName").unwrap(),
            CimValue::from("web01")
        );
    }

    #[test]
    fn test_failed_fetch_fires_deleted_once() {
        let f = fixture();
        let proxy = load(&f, "A");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        proxy
            .on_deleted(Arc::new(move |_: &ObjectKey| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        f.store.fail_next(
            StoreCall::GetInstance,
            StoreError::not_found(proxy.key().path()),
        );
        assert!(proxy.update_property_cache(Duration::ZERO).is_err());
        assert!(proxy.update_property_cache(Duration::ZERO).is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(f.store.call_count(StoreCall::GetInstance), 2);
        assert_eq!(f.events.active_subscriptions(), 0);
    }

    #[test]
    fn test_deletion_event_evicts_proxy() {
        let f = fixture();
        let proxy = load(&f, "A");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        proxy
            .on_deleted(Arc::new(move |_: &ObjectKey| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(f.events.active_subscriptions(), 1);

        f.store.remove(proxy.key().path());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(proxy.is_deleted());
        assert!(f.factory.repository().get(proxy.key()).is_none());
        assert_eq!(
            proxy.get_property("ElementName").unwrap_err().kind(),
            ErrorKind::ObjectNotFound
        );
    }

    #[test]
    fn test_put_properties_merges_confirmed_values() {
        let f = fixture();
        let proxy = load(&f, "A");
        let updated = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&updated);
        proxy.on_property_cache_updated(Arc::new(move |_: &ObjectKey| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let confirmed = proxy
            .put_properties(&PropertyMap::new().with("ElementName", "renamed"))
            .unwrap();
        assert_eq!(confirmed.get("ElementName"), Some(&CimValue::from("renamed")));
        assert_eq!(
            proxy.get_property("ElementName").unwrap(),
            CimValue::from("renamed")
        );
        assert_eq!(updated.load(Ordering::SeqCst), 1);
        assert_eq!(f.store.call_count(StoreCall::GetInstance), 1);
    }

    #[test]
    fn test_put_on_unfetched_proxy_notifies() {
        let f = fixture();
        let path = f.store.insert(NS, vm("A")).unwrap();
        let proxy = f
            .factory
            .get_or_create_delayed(&ObjectKey::new(path).unwrap())
            .unwrap();
        let updated = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&updated);
        proxy.on_property_cache_updated(Arc::new(move |_: &ObjectKey| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        proxy
            .put_properties(&PropertyMap::new().with("ElementName", "renamed"))
            .unwrap();
        assert_eq!(updated.load(Ordering::SeqCst), 1);
        assert_eq!(f.store.call_count(StoreCall::GetInstance), 0);

        assert_eq!(
            proxy.get_property("ElementName").unwrap(),
            CimValue::from("renamed")
        );
        assert_eq!(f.store.call_count(StoreCall::GetInstance), 1);
    }

    #[test]
    fn test_put_failure_leaves_cache() {
        let f = fixture();
        let proxy = load(&f, "A");
        f.store.fail_next(
            StoreCall::ModifyInstance,
            StoreError::call_failed(FailureReason::AccessDenied, "denied"),
        );
        let err = proxy
            .put_properties(&PropertyMap::new().with("ElementName", "renamed"))
            .unwrap_err();
        assert_eq!(err.failure_reason(), Some(FailureReason::AccessDenied));
        assert_eq!(
            proxy.get_property("ElementName").unwrap(),
            CimValue::from("web01")
        );
    }

    #[test]
    fn test_related_keys_are_cached_per_association() {
        let f = fixture();
        let proxy = load(&f, "A");
        let memory = f
            .store
            .insert(
                NS,
                CimInstance::new("Msvm_Memory").with_key("DeviceID", "Microsoft:Memory"),
            )
            .unwrap();
        f.store.link(
            "Msvm_SystemDevice",
            ("GroupComponent", proxy.key().path()),
            ("PartComponent", &memory),
        );
        let assoc = Association::to_class("Msvm_SystemDevice", "Msvm_Memory", None);

        let first = proxy.get_related_object_keys(&assoc, Duration::MAX).unwrap();
        let second = proxy.get_related_object_keys(&assoc, Duration::MAX).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert_eq!(f.store.call_count(StoreCall::EnumerateAssociated), 1);

        proxy.update_association_cache(Duration::ZERO, &[]).unwrap();
        assert_eq!(f.store.call_count(StoreCall::EnumerateAssociated), 2);
        proxy
            .update_association_cache(Duration::ZERO, &[assoc.clone()])
            .unwrap();
        assert_eq!(f.store.call_count(StoreCall::EnumerateAssociated), 2);

        proxy.invalidate_association_cache();
        proxy.update_one_cached_association(&assoc, Duration::MAX).unwrap();
        assert_eq!(f.store.call_count(StoreCall::EnumerateAssociated), 3);
    }

    #[test]
    fn test_do_not_update_association_skipped_in_bulk_refresh() {
        let f = fixture();
        let proxy = load(&f, "A");
        let assoc = Association::to_class(
            "Msvm_ComputerSystemSummaryInformation",
            "Msvm_SummaryInformation",
            None,
        )
        .do_not_update();
        proxy.get_related_object_keys(&assoc, Duration::MAX).unwrap();
        proxy.update_association_cache(Duration::ZERO, &[]).unwrap();
        assert_eq!(f.store.call_count(StoreCall::EnumerateAssociated), 1);
    }

    #[test]
    fn test_watch_modifications_updates_cache() {
        let f = fixture();
        let proxy = load(&f, "A");
        proxy.watch_modifications().unwrap();
        f.store
            .set_property(proxy.key().path(), "EnabledState", 3u16)
            .unwrap();
        assert_eq!(
            proxy.get_property("EnabledState").unwrap(),
            CimValue::UInt(3)
        );
        assert_eq!(f.store.call_count(StoreCall::GetInstance), 1);

        proxy.unwatch_modifications();
        assert_eq!(f.events.active_subscriptions(), 0);
    }

    #[test]
    fn test_invoke_method_not_found() {
        let f = fixture();
        let proxy = load(&f, "A");
        let err = proxy
            .invoke_method("Frobnicate", &PropertyMap::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClassDefinitionMismatch);

        f.store
            .on_method("Msvm_ComputerSystem", "RequestStateChange", |_, _, _| {
                Ok(MethodResult::success())
            });
        let result = proxy
            .invoke_method("RequestStateChange", &PropertyMap::new())
            .unwrap();
        assert_eq!(result.return_value, 0);
    }

    #[test]
    fn test_dropping_proxy_releases_watches() {
        let f = fixture();
        let proxy = load(&f, "A");
        proxy.watch_modifications().unwrap();
        assert_eq!(f.store.subscription_count(), 1);
        f.factory.repository().clear();
        drop(proxy);
        assert_eq!(f.store.subscription_count(), 0);
    }
}
