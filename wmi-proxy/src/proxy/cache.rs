use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::association::Association;
use crate::object::{ObjectKey, PropertyMap};

struct CachedProperties {
    properties: Arc<PropertyMap>,
    refreshed: Instant,
}

/// Property snapshot of one remote object.
///
/// Readers get an `Arc` of the whole map; writers swap it, so a reader never
/// observes a half-applied refresh.
#[derive(Default)]
pub(crate) struct PropertyCache {
    inner: RwLock<Option<CachedProperties>>,
}

impl PropertyCache {
    pub fn get(&self) -> Option<Arc<PropertyMap>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|c| Arc::clone(&c.properties))
    }

    pub fn replace(&self, properties: PropertyMap) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(CachedProperties {
            properties: Arc::new(properties),
            refreshed: Instant::now(),
        });
    }

    /// Overlay `changes` on the current snapshot. Does nothing when nothing
    /// is cached yet, since a partial map would pass for a full one.
    pub fn merge(&self, changes: &PropertyMap) -> bool {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(cached) => {
                let mut merged = PropertyMap::clone(&cached.properties);
                merged.merge(changes);
                cached.properties = Arc::new(merged);
                true
            }
            None => false,
        }
    }

    pub fn invalidate(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// True when nothing is cached or the snapshot is at least `threshold` old.
    pub fn is_stale(&self, threshold: Duration) -> bool {
        match self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(cached) => cached.refreshed.elapsed() >= threshold,
            None => true,
        }
    }
}

struct CachedKeys {
    keys: Arc<Vec<ObjectKey>>,
    refreshed: Instant,
}

/// Related-object keys per association, each entry aged independently.
#[derive(Default)]
pub(crate) struct AssociationCache {
    entries: Mutex<HashMap<Association, CachedKeys>>,
}

impl AssociationCache {
    fn lock(&self) -> MutexGuard<'_, HashMap<Association, CachedKeys>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached keys younger than `threshold`.
    pub fn get_fresh(&self, association: &Association, threshold: Duration) -> Option<Arc<Vec<ObjectKey>>> {
        self.lock()
            .get(association)
            .filter(|c| c.refreshed.elapsed() < threshold)
            .map(|c| Arc::clone(&c.keys))
    }

    pub fn insert(&self, association: Association, keys: Vec<ObjectKey>) -> Arc<Vec<ObjectKey>> {
        let keys = Arc::new(keys);
        self.lock().insert(
            association,
            CachedKeys {
                keys: Arc::clone(&keys),
                refreshed: Instant::now(),
            },
        );
        keys
    }

    pub fn contains(&self, association: &Association) -> bool {
        self.lock().contains_key(association)
    }

    pub fn associations(&self) -> Vec<Association> {
        self.lock().keys().cloned().collect()
    }

    pub fn invalidate(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::CimValue;

    #[test]
    fn test_property_cache_staleness() {
        let cache = PropertyCache::default();
        assert!(cache.is_stale(Duration::from_secs(60)));
        assert!(!cache.merge(&PropertyMap::new().with("A", 1u32)));

        cache.replace(PropertyMap::new().with("A", 1u32));
        assert!(!cache.is_stale(Duration::from_secs(60)));
        assert!(cache.is_stale(Duration::ZERO));

        cache.invalidate();
        assert!(cache.get().is_none());
    }

    #[test]
    fn test_merge_swaps_snapshot() {
        let cache = PropertyCache::default();
        cache.replace(PropertyMap::new().with("A", 1u32).with("B", 2u32));
        let before = cache.get().unwrap();
        assert!(cache.merge(&PropertyMap::new().with("B", 20u32)));
        let after = cache.get().unwrap();
        assert_eq!(before.get("B"), Some(&CimValue::UInt(2)));
        assert_eq!(after.get("B"), Some(&CimValue::UInt(20)));
        assert_eq!(after.get("A"), Some(&CimValue::UInt(1)));
    }

    #[test]
    fn test_association_cache() {
        let cache = AssociationCache::default();
        let assoc = Association::new("Msvm_SystemDevice");
        let key = ObjectKey::for_class("H", "ns", "Msvm_Memory");
        cache.insert(assoc.clone(), vec![key.clone()]);
        assert_eq!(
            cache.get_fresh(&assoc, Duration::MAX).map(|k| k.len()),
            Some(1)
        );
        assert!(cache.get_fresh(&assoc, Duration::ZERO).is_none());
        assert!(cache.contains(&assoc));
        cache.invalidate();
        assert!(cache.associations().is_empty());
    }
}
