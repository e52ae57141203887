//! Single subscription fanned out to many per-object handlers.

use std::collections::HashMap;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::object::ObjectKey;
use crate::store::{EventQuery, InstanceEvent, InstanceStore, Subscription};

/// Callback for a delivered event.
pub type EventHandler = Arc<dyn Fn(&InstanceEvent) + Send + Sync>;

/// Token returned by registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Events that arrived before anyone registered for their key.
///
/// Two generations rotate every `window`, so an undelivered event lives at
/// most two windows. Delivery itself checks the arrival time against the
/// window.
struct MissedEvents {
    current: HashMap<ObjectKey, (Instant, InstanceEvent)>,
    previous: HashMap<ObjectKey, (Instant, InstanceEvent)>,
    rotated: Instant,
}

impl MissedEvents {
    fn new() -> Self {
        Self {
            current: HashMap::new(),
            previous: HashMap::new(),
            rotated: Instant::now(),
        }
    }

    fn age(&mut self, now: Instant, window: Duration) {
        let elapsed = now.saturating_duration_since(self.rotated);
        if elapsed >= window.saturating_mul(2) {
            self.current.clear();
            self.previous.clear();
            self.rotated = now;
        } else if elapsed >= window {
            self.previous = mem::take(&mut self.current);
            self.rotated = now;
        }
    }

    fn push(&mut self, key: ObjectKey, event: InstanceEvent, now: Instant) {
        self.previous.remove(&key);
        self.current.insert(key, (now, event));
    }

    fn take(&mut self, key: &ObjectKey, now: Instant, window: Duration) -> Option<InstanceEvent> {
        let current = self.current.remove(key);
        let previous = self.previous.remove(key);
        current
            .or(previous)
            .filter(|(arrived, _)| now.saturating_duration_since(*arrived) <= window)
            .map(|(_, event)| event)
    }

    fn len(&self) -> usize {
        self.current.len() + self.previous.len()
    }
}

struct MonitorState {
    handlers: HashMap<ObjectKey, Vec<(HandlerId, EventHandler)>>,
    /// Key property names used to rebuild keys from event targets.
    key_names: Option<Vec<String>>,
    missed: MissedEvents,
    subscription: Option<Box<dyn Subscription>>,
    next_id: u64,
}

/// Owns one event subscription for a class and routes arrivals by key.
///
/// Handlers run outside the monitor lock, in registration order, and may
/// register or unregister handlers themselves.
pub struct InstanceEventBulkMonitor {
    store: Arc<dyn InstanceStore>,
    namespace: String,
    query: EventQuery,
    missed_event_window: Duration,
    state: Mutex<MonitorState>,
}

impl InstanceEventBulkMonitor {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        namespace: &str,
        query: EventQuery,
        missed_event_window: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            namespace: namespace.to_string(),
            query,
            missed_event_window,
            state: Mutex::new(MonitorState {
                handlers: HashMap::new(),
                key_names: None,
                missed: MissedEvents::new(),
                subscription: None,
                next_id: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn query(&self) -> &EventQuery {
        &self.query
    }

    /// Add `handler` for `key`, subscribing if this is the first handler.
    ///
    /// The remote subscribe runs without the monitor lock. When two first
    /// registrations race, the subscription installed first is kept and the
    /// other is canceled.
    ///
    /// A buffered event for `key` that is still inside the missed-event
    /// window is delivered to `handler` before this returns.
    pub fn register(self: &Arc<Self>, key: ObjectKey, handler: EventHandler) -> Result<HandlerId> {
        let mut fresh: Option<Box<dyn Subscription>> = None;
        let (id, missed, surplus) = loop {
            let mut state = self.lock();
            if state.subscription.is_none() {
                match fresh.take() {
                    Some(subscription) => state.subscription = Some(subscription),
                    None => {
                        drop(state);
                        fresh = Some(self.subscribe()?);
                        continue;
                    }
                }
            }
            let now = Instant::now();
            if state.key_names.is_none() && !key.is_class_key() {
                state.key_names = Some(key.path().key_names().map(str::to_string).collect());
            }

            let id = HandlerId(state.next_id);
            state.next_id += 1;
            state
                .handlers
                .entry(key.clone())
                .or_default()
                .push((id, Arc::clone(&handler)));

            state.missed.age(now, self.missed_event_window);
            let missed = state.missed.take(&key, now, self.missed_event_window);
            break (id, missed, fresh.take());
        };

        if let Some(subscription) = surplus {
            tracing::debug!(query = %self.query, "dropping duplicate instance event subscription");
            subscription.cancel();
        }
        if let Some(event) = missed {
            tracing::debug!(key = %key, "delivering missed event to late handler");
            invoke(&handler, &event, &key);
        }
        Ok(id)
    }

    fn subscribe(self: &Arc<Self>) -> Result<Box<dyn Subscription>> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let sink = Arc::new(move |event: InstanceEvent| {
            if let Some(monitor) = weak.upgrade() {
                monitor.on_event(event);
            }
        });
        tracing::info!(
            namespace = %self.namespace,
            query = %self.query,
            "subscribing to instance events"
        );
        self.store
            .subscribe(&self.namespace, &self.query, sink)
            .map_err(|e| Error::from_store_on(self.store.server_name(), e))
    }

    /// Remove a handler. Returns false when it was not registered.
    ///
    /// The subscription is canceled once no handler remains.
    pub fn unregister(&self, key: &ObjectKey, id: HandlerId) -> bool {
        let (removed, subscription) = {
            let mut state = self.lock();
            let removed = match state.handlers.get_mut(key) {
                Some(list) => {
                    let before = list.len();
                    list.retain(|(h, _)| *h != id);
                    let removed = list.len() != before;
                    if list.is_empty() {
                        state.handlers.remove(key);
                    }
                    removed
                }
                None => false,
            };
            let subscription = if state.handlers.is_empty() {
                state.key_names = None;
                state.subscription.take()
            } else {
                None
            };
            (removed, subscription)
        };
        if let Some(subscription) = subscription {
            tracing::info!(query = %self.query, "canceling instance event subscription");
            subscription.cancel();
        }
        removed
    }

    /// Route one arrived event.
    pub fn on_event(&self, event: InstanceEvent) {
        let now = Instant::now();
        let server = self.store.server_name();
        let targets = {
            let mut state = self.lock();
            let key = match &state.key_names {
                Some(names) => ObjectKey::from_instance_with_keys(
                    server,
                    &self.namespace,
                    &event.target,
                    names.iter().map(String::as_str),
                ),
                None => ObjectKey::from_instance(server, &self.namespace, &event.target),
            };
            let key = match key {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(error = %e, class = event.target.class_name(), "dropping event with unusable key");
                    return;
                }
            };

            let class_key = ObjectKey::for_class(server, &self.namespace, &self.query.class_name);
            let mut targets: Vec<EventHandler> = state
                .handlers
                .get(&key)
                .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default();
            let has_object_handlers = !targets.is_empty();
            if let Some(list) = state.handlers.get(&class_key) {
                targets.extend(list.iter().map(|(_, h)| Arc::clone(h)));
            }

            state.missed.age(now, self.missed_event_window);
            if !has_object_handlers {
                tracing::trace!(key = %key, "buffering event with no registered handler");
                state.missed.push(key.clone(), event.clone(), now);
            }
            (key, targets)
        };

        let (key, handlers) = targets;
        for handler in &handlers {
            invoke(handler, &event, &key);
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.lock().subscription.is_some()
    }

    pub fn handler_count(&self) -> usize {
        self.lock().handlers.values().map(Vec::len).sum()
    }

    pub fn missed_event_count(&self) -> usize {
        self.lock().missed.len()
    }
}

fn invoke(handler: &EventHandler, event: &InstanceEvent, key: &ObjectKey) {
    if panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
        tracing::warn!(key = %key, kind = %event.kind, "instance event handler panicked");
    }
}
