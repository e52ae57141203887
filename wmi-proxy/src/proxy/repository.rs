use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use super::object::Proxy;
use crate::config::CacheConfig;
use crate::object::{fold, ObjectKey};

enum Entry {
    Strong { proxy: Arc<Proxy>, last_access: Instant },
    Weak(Weak<Proxy>),
}

impl Entry {
    fn strong(proxy: Arc<Proxy>) -> Self {
        Entry::Strong {
            proxy,
            last_access: Instant::now(),
        }
    }

    /// Live proxy, promoting a weak entry back to strong.
    fn touch(&mut self) -> Option<Arc<Proxy>> {
        match self {
            Entry::Strong { proxy, last_access } => {
                *last_access = Instant::now();
                Some(Arc::clone(proxy))
            }
            Entry::Weak(weak) => {
                let proxy = weak.upgrade()?;
                *self = Entry::strong(Arc::clone(&proxy));
                Some(proxy)
            }
        }
    }

    fn peek(&self) -> Option<Arc<Proxy>> {
        match self {
            Entry::Strong { proxy, .. } => Some(Arc::clone(proxy)),
            Entry::Weak(weak) => weak.upgrade(),
        }
    }
}

#[derive(Default)]
struct RepositoryState {
    entries: HashMap<ObjectKey, Entry>,
    /// Base-class keys resolved to a concrete key.
    aliases: HashMap<ObjectKey, ObjectKey>,
    /// Deleted keys and when they were seen deleted.
    tombstones: HashMap<ObjectKey, Instant>,
}

impl RepositoryState {
    fn resolve<'a>(&'a self, key: &'a ObjectKey) -> &'a ObjectKey {
        self.aliases.get(key).unwrap_or(key)
    }

    fn drop_aliases_of(&mut self, target: &ObjectKey) {
        self.aliases.retain(|_, concrete| *concrete != *target);
    }
}

/// Result of one [`ProxyRepository::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Strong entries demoted to weak.
    pub demoted: usize,
    /// Weak entries whose proxy was gone.
    pub dropped: usize,
    /// Tombstones older than the idle timeout.
    pub expired_tombstones: usize,
}

/// Identity map of live proxies for one connection.
///
/// Entries start strong. Idle entries are demoted to weak references by
/// [`sweep`](Self::sweep), so a proxy nobody holds can be reclaimed while one
/// still in use keeps its identity. Keys of deleted objects are remembered
/// for one idle timeout.
pub struct ProxyRepository {
    state: Mutex<RepositoryState>,
    idle_timeout: Duration,
    sweeper: Mutex<Option<Sender<()>>>,
}

impl ProxyRepository {
    pub fn new(config: &CacheConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RepositoryState::default()),
            idle_timeout: config.proxy_idle_timeout(),
            sweeper: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RepositoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live proxy for `key`, or for the concrete key `key` is an alias of.
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<Proxy>> {
        let mut state = self.lock();
        let key = state.resolve(key).clone();
        let Some(entry) = state.entries.get_mut(&key) else {
            state.drop_aliases_of(&key);
            return None;
        };
        let found = entry.touch();
        if found.is_none() {
            state.entries.remove(&key);
            state.drop_aliases_of(&key);
        }
        found
    }

    /// Register `proxy` under its key, unless a live proxy is already there,
    /// in which case that one is returned.
    pub fn register(&self, proxy: Arc<Proxy>) -> Arc<Proxy> {
        let mut state = self.lock();
        let key = proxy.key().clone();
        if let Some(existing) = state.entries.get_mut(&key).and_then(Entry::touch) {
            return existing;
        }
        tracing::trace!(path = %key, "registering proxy");
        state.entries.insert(key, Entry::strong(Arc::clone(&proxy)));
        proxy
    }

    /// Make `alias` resolve to the proxy registered under `concrete`.
    pub fn register_alias(&self, alias: &ObjectKey, concrete: &ObjectKey) {
        if alias == concrete {
            return;
        }
        tracing::trace!(alias = %alias, path = %concrete, "registering proxy alias");
        self.lock().aliases.insert(alias.clone(), concrete.clone());
    }

    /// Evict `key` and remember it, and any alias of it, as deleted.
    pub(crate) fn remove_deleted(&self, key: &ObjectKey) {
        let removed = {
            let mut state = self.lock();
            let now = Instant::now();
            let aliases: Vec<ObjectKey> = state
                .aliases
                .iter()
                .filter(|(_, concrete)| *concrete == key)
                .map(|(alias, _)| alias.clone())
                .collect();
            for alias in aliases {
                state.aliases.remove(&alias);
                state.tombstones.insert(alias, now);
            }
            state.tombstones.insert(key.clone(), now);
            state.entries.remove(key)
        };
        tracing::debug!(path = %key, "evicted deleted proxy");
        drop(removed);
    }

    pub fn is_tombstoned(&self, key: &ObjectKey) -> bool {
        self.lock().tombstones.contains_key(key)
    }

    /// Forget that `key` was deleted; returns whether it was.
    pub fn lift_tombstone(&self, key: &ObjectKey) -> bool {
        self.lock().tombstones.remove(key).is_some()
    }

    /// Evict one entry without marking it deleted.
    pub fn unregister(&self, key: &ObjectKey) -> Option<Arc<Proxy>> {
        let mut state = self.lock();
        state.drop_aliases_of(key);
        state.entries.remove(key)?.peek()
    }

    /// Evict everything, including tombstones.
    pub fn clear(&self) {
        let entries = {
            let mut state = self.lock();
            state.tombstones.clear();
            state.aliases.clear();
            std::mem::take(&mut state.entries)
        };
        tracing::debug!(count = entries.len(), "cleared proxy repository");
        drop(entries);
    }

    /// Live proxies of `class_name` on this connection.
    pub fn proxies_of_class(&self, class_name: &str) -> Vec<Arc<Proxy>> {
        let class_name = fold(class_name);
        self.lock()
            .entries
            .iter()
            .filter(|(key, _)| fold(key.class_name()) == class_name)
            .filter_map(|(_, entry)| entry.peek())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Demote idle strong entries, drop dead weak ones and expire old
    /// tombstones.
    pub fn sweep(&self) -> SweepStats {
        let now = Instant::now();
        let mut stats = SweepStats::default();
        let mut demoted = Vec::new();
        {
            let mut state = self.lock();
            state.entries.retain(|_, entry| match entry {
                Entry::Strong { proxy, last_access } => {
                    if now.saturating_duration_since(*last_access) >= self.idle_timeout {
                        let weak = Arc::downgrade(proxy);
                        let strong = std::mem::replace(entry, Entry::Weak(weak));
                        demoted.push(strong);
                        stats.demoted += 1;
                    }
                    true
                }
                Entry::Weak(weak) => {
                    let alive = weak.strong_count() > 0;
                    if !alive {
                        stats.dropped += 1;
                    }
                    alive
                }
            });
            let RepositoryState {
                entries,
                aliases,
                tombstones,
            } = &mut *state;
            aliases.retain(|_, concrete| entries.contains_key(&*concrete));
            let before = tombstones.len();
            tombstones.retain(|_, seen| now.saturating_duration_since(*seen) < self.idle_timeout);
            stats.expired_tombstones = before - tombstones.len();
        }
        // Proxies released by demotion drop here, outside the lock.
        drop(demoted);
        tracing::debug!(
            demoted = stats.demoted,
            dropped = stats.dropped,
            expired_tombstones = stats.expired_tombstones,
            "swept proxy repository"
        );
        stats
    }

    /// Run [`sweep`](Self::sweep) every `interval` on a background thread.
    ///
    /// The thread exits when the repository is dropped or the sweeper is
    /// restarted.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let weak = Arc::downgrade(self);
        *self.sweeper.lock().unwrap_or_else(PoisonError::into_inner) = Some(stop_tx);

        tracing::info!(interval_secs = interval.as_secs(), "starting proxy repository sweeper");
        thread::spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => match weak.upgrade() {
                    Some(repository) => {
                        repository.sweep();
                    }
                    None => break,
                },
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });
    }
}
