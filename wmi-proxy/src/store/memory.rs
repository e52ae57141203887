//! In-process [`InstanceStore`] with call counting and failure injection.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use uuid::Uuid;

use super::{
    EventQuery, EventSink, InstanceEvent, InstanceEventKind, InstanceStore, MethodResult,
    Subscription,
};
use crate::association::{Association, AssociationKind};
use crate::error::{StoreError, StoreResult};
use crate::object::{fold, CimInstance, CimValue, ObjectKey, PropertyMap, WmiObjectPath};

/// Handler invoked for a registered method. Runs without the store lock held,
/// so it may call back into the store.
pub type MethodHandler =
    Arc<dyn Fn(&MemoryStore, &WmiObjectPath, &PropertyMap) -> StoreResult<MethodResult> + Send + Sync>;

/// Operations counted by [`MemoryStore::call_count`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreCall {
    GetInstance,
    EnumerateInstances,
    EnumerateAssociated,
    ModifyInstance,
    InvokeMethod,
    Subscribe,
}

struct Link {
    association_class: String,
    ends: [(String, WmiObjectPath); 2],
}

struct Registration {
    namespace: String,
    query: EventQuery,
    sink: EventSink,
}

#[derive(Default)]
struct State {
    instances: HashMap<WmiObjectPath, CimInstance>,
    superclasses: HashMap<String, String>,
    links: Vec<Link>,
    methods: HashMap<(String, String), MethodHandler>,
    failures: HashMap<StoreCall, VecDeque<StoreError>>,
    calls: HashMap<StoreCall, usize>,
    subscriptions: HashMap<u64, Registration>,
    next_subscription: u64,
}

impl State {
    fn is_a(&self, class_name: &str, base: &str) -> bool {
        let target = fold(base);
        let mut current = fold(class_name);
        loop {
            if current == target {
                return true;
            }
            match self.superclasses.get(&current) {
                Some(parent) => current = parent.clone(),
                None => return false,
            }
        }
    }

    /// Record the call and pop an injected failure, if any.
    fn enter(&mut self, call: StoreCall) -> StoreResult<()> {
        *self.calls.entry(call).or_default() += 1;
        match self.failures.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn find(&self, path: &WmiObjectPath) -> Option<(&WmiObjectPath, &CimInstance)> {
        if let Some(found) = self.instances.get_key_value(path) {
            return Some(found);
        }
        // A path naming a base class also resolves instances of subclasses.
        self.instances.iter().find(|(stored, inst)| {
            self.is_a(inst.class_name(), path.class_name())
                && (*stored).clone().with_class(path.class_name()) == *path
        })
    }

    fn sinks_for(&self, namespace: &str, event: &InstanceEvent) -> Vec<EventSink> {
        let mut regs: Vec<_> = self
            .subscriptions
            .iter()
            .filter(|(_, r)| {
                r.query.kind == event.kind
                    && r.namespace.eq_ignore_ascii_case(namespace)
                    && self.is_a(event.target.class_name(), &r.query.class_name)
            })
            .collect();
        regs.sort_by_key(|(id, _)| **id);
        regs.into_iter().map(|(_, r)| Arc::clone(&r.sink)).collect()
    }
}

/// In-memory instance store.
///
/// Instances are addressed by the path built from their key properties.
/// Cloning shares the underlying state.
#[derive(Clone)]
pub struct MemoryStore {
    server: String,
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new(server: &str) -> Self {
        Self {
            server: server.to_string(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Path under which `instance` is stored in `namespace`.
    pub fn path_of(&self, namespace: &str, instance: &CimInstance) -> StoreResult<WmiObjectPath> {
        ObjectKey::from_instance(&self.server, namespace, instance)
            .map(ObjectKey::into_path)
            .map_err(|e| StoreError::call_failed(crate::error::FailureReason::InvalidParameter, e.to_string()))
    }

    /// Declare `class_name` as a subclass of `superclass`.
    pub fn declare_subclass(&self, class_name: &str, superclass: &str) {
        self.lock()
            .superclasses
            .insert(fold(class_name), fold(superclass));
    }

    /// Store an instance and emit a creation event.
    pub fn insert(&self, namespace: &str, instance: CimInstance) -> StoreResult<WmiObjectPath> {
        let path = self.path_of(namespace, &instance)?;
        self.lock().instances.insert(path.clone(), instance.clone());
        self.emit(
            namespace,
            InstanceEvent::new(InstanceEventKind::Creation, instance),
        );
        Ok(path)
    }

    /// Change one property and emit a modification event.
    pub fn set_property(
        &self,
        path: &WmiObjectPath,
        name: &str,
        value: impl Into<CimValue>,
    ) -> StoreResult<()> {
        let value = value.into();
        self.update(path, |inst| inst.set_property(name, value))
    }

    /// Mutate a stored instance and emit a modification event.
    pub fn update(
        &self,
        path: &WmiObjectPath,
        mutate: impl FnOnce(&mut CimInstance),
    ) -> StoreResult<()> {
        let event = {
            let mut state = self.lock();
            let inst = state
                .instances
                .get_mut(path)
                .ok_or_else(|| StoreError::not_found(path))?;
            let previous = inst.clone();
            mutate(inst);
            InstanceEvent {
                kind: InstanceEventKind::Modification,
                target: inst.clone(),
                previous: Some(previous),
            }
        };
        self.emit(path.namespace(), event);
        Ok(())
    }

    /// Delete an instance and emit a deletion event.
    pub fn remove(&self, path: &WmiObjectPath) -> Option<CimInstance> {
        let removed = {
            let mut state = self.lock();
            let removed = state.instances.remove(path);
            if removed.is_some() {
                state
                    .links
                    .retain(|l| l.ends.iter().all(|(_, end)| end != path));
            }
            removed
        };
        if let Some(inst) = &removed {
            self.emit(
                path.namespace(),
                InstanceEvent::new(InstanceEventKind::Deletion, inst.clone()),
            );
        }
        removed
    }

    pub fn contains(&self, path: &WmiObjectPath) -> bool {
        self.lock().instances.contains_key(path)
    }

    /// Relate two stored objects through `association_class`, each end with its role.
    pub fn link(
        &self,
        association_class: &str,
        (role_a, a): (&str, &WmiObjectPath),
        (role_b, b): (&str, &WmiObjectPath),
    ) {
        self.lock().links.push(Link {
            association_class: association_class.to_string(),
            ends: [(role_a.to_string(), a.clone()), (role_b.to_string(), b.clone())],
        });
    }

    /// Route `method` calls on `class_name` (or a subclass) to `handler`.
    pub fn on_method<F>(&self, class_name: &str, method: &str, handler: F)
    where
        F: Fn(&MemoryStore, &WmiObjectPath, &PropertyMap) -> StoreResult<MethodResult>
            + Send
            + Sync
            + 'static,
    {
        self.lock()
            .methods
            .insert((fold(class_name), fold(method)), Arc::new(handler));
    }

    /// Fail the next `call` with `err`. Failures queue in order.
    pub fn fail_next(&self, call: StoreCall, err: StoreError) {
        self.lock().failures.entry(call).or_default().push_back(err);
    }

    pub fn call_count(&self, call: StoreCall) -> usize {
        self.lock().calls.get(&call).copied().unwrap_or(0)
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    /// Deliver `event` to every matching subscription.
    pub fn emit(&self, namespace: &str, event: InstanceEvent) {
        let sinks = self.lock().sinks_for(namespace, &event);
        tracing::trace!(
            kind = %event.kind,
            class = event.target.class_name(),
            subscribers = sinks.len(),
            "memory store emitting event"
        );
        for sink in sinks {
            sink(event.clone());
        }
    }

    /// Store a running `Msvm_ConcreteJob` and return its path.
    pub fn create_job(&self, namespace: &str, name: &str) -> StoreResult<WmiObjectPath> {
        let job = CimInstance::new("Msvm_ConcreteJob")
            .with_key("InstanceID", Uuid::new_v4().to_string())
            .with_property("ElementName", name)
            .with_property("JobState", 4u16)
            .with_property("PercentComplete", 0u16)
            .with_property("ErrorCode", 0u16)
            .with_property("Cancellable", true)
            .with_property("ElapsedTime", std::time::Duration::ZERO);
        self.insert(namespace, job)
    }

    /// Move a job to a terminal state.
    pub fn finish_job(
        &self,
        job: &WmiObjectPath,
        job_state: u16,
        error_code: u16,
        summary: &str,
        details: &str,
    ) -> StoreResult<()> {
        self.update(job, |inst| {
            inst.set_property("JobState", job_state);
            inst.set_property("PercentComplete", 100u16);
            inst.set_property("ErrorCode", error_code);
            inst.set_property("ErrorSummaryDescription", summary);
            inst.set_property("ErrorDescription", details);
        })
    }
}

impl InstanceStore for MemoryStore {
    fn server_name(&self) -> &str {
        &self.server
    }

    fn get_instance(&self, path: &WmiObjectPath) -> StoreResult<CimInstance> {
        let mut state = self.lock();
        state.enter(StoreCall::GetInstance)?;
        state
            .find(path)
            .map(|(_, inst)| inst.clone())
            .ok_or_else(|| StoreError::not_found(path))
    }

    fn enumerate_instances(
        &self,
        namespace: &str,
        class_name: &str,
    ) -> StoreResult<Vec<CimInstance>> {
        let mut state = self.lock();
        state.enter(StoreCall::EnumerateInstances)?;
        let mut found: Vec<_> = state
            .instances
            .iter()
            .filter(|(path, inst)| {
                path.namespace().eq_ignore_ascii_case(namespace)
                    && state.is_a(inst.class_name(), class_name)
            })
            .collect();
        found.sort_by_key(|(path, _)| path.to_string());
        Ok(found.into_iter().map(|(_, inst)| inst.clone()).collect())
    }

    fn enumerate_associated_instances(
        &self,
        source: &WmiObjectPath,
        association: &Association,
    ) -> StoreResult<Vec<CimInstance>> {
        let mut state = self.lock();
        state.enter(StoreCall::EnumerateAssociated)?;
        let (association_class, result_class, source_role, result_role) = match association.kind()
        {
            AssociationKind::Instances { class_name } => {
                let ns = source.namespace();
                let mut found: Vec<_> = state
                    .instances
                    .iter()
                    .filter(|(p, inst)| {
                        p.namespace().eq_ignore_ascii_case(ns)
                            && state.is_a(inst.class_name(), class_name)
                    })
                    .collect();
                found.sort_by_key(|(p, _)| p.to_string());
                return Ok(found.into_iter().map(|(_, i)| i.clone()).collect());
            }
            AssociationKind::Associators {
                association_class,
                result_class,
                source_role,
                result_role,
            } => (association_class, result_class, source_role, result_role),
        };
        let Some((source, _)) = state.find(source) else {
            return Err(StoreError::not_found(source));
        };
        let source = source.clone();

        let role_matches =
            |want: &Option<String>, have: &str| want.as_ref().map_or(true, |w| w.eq_ignore_ascii_case(have));

        let mut results = Vec::new();
        for link in &state.links {
            if !state.is_a(&link.association_class, association_class) {
                continue;
            }
            for (near, far) in [(0, 1), (1, 0)] {
                let (near_role, near_path) = &link.ends[near];
                let (far_role, far_path) = &link.ends[far];
                if *near_path != source
                    || !role_matches(source_role, near_role)
                    || !role_matches(result_role, far_role)
                {
                    continue;
                }
                let Some(inst) = state.instances.get(far_path) else {
                    continue;
                };
                if result_class
                    .as_ref()
                    .map_or(true, |rc| state.is_a(inst.class_name(), rc))
                {
                    results.push(inst.clone());
                }
            }
        }
        Ok(results)
    }

    fn modify_instance(
        &self,
        path: &WmiObjectPath,
        changes: &PropertyMap,
    ) -> StoreResult<CimInstance> {
        {
            let mut state = self.lock();
            state.enter(StoreCall::ModifyInstance)?;
            if !state.instances.contains_key(path) {
                return Err(StoreError::not_found(path));
            }
        }
        self.update(path, |inst| inst.properties_mut().merge(changes))?;
        self.lock()
            .instances
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::not_found(path))
    }

    fn invoke_method(
        &self,
        path: &WmiObjectPath,
        method: &str,
        args: &PropertyMap,
    ) -> StoreResult<MethodResult> {
        let handler = {
            let mut state = self.lock();
            state.enter(StoreCall::InvokeMethod)?;
            let class_name = match state.find(path) {
                Some((_, inst)) => inst.class_name().to_string(),
                None if path.is_class_path() => path.class_name().to_string(),
                None => return Err(StoreError::not_found(path)),
            };
            let mut class = fold(&class_name);
            loop {
                if let Some(h) = state.methods.get(&(class.clone(), fold(method))) {
                    break Arc::clone(h);
                }
                match state.superclasses.get(&class) {
                    Some(parent) => class = parent.clone(),
                    None => {
                        return Err(StoreError::MethodNotFound {
                            class_name,
                            method: method.to_string(),
                        })
                    }
                }
            }
        };
        handler(self, path, args)
    }

    fn subscribe(
        &self,
        namespace: &str,
        query: &EventQuery,
        sink: EventSink,
    ) -> StoreResult<Box<dyn Subscription>> {
        let mut state = self.lock();
        state.enter(StoreCall::Subscribe)?;
        let id = state.next_subscription;
        state.next_subscription += 1;
        state.subscriptions.insert(
            id,
            Registration {
                namespace: namespace.to_string(),
                query: query.clone(),
                sink,
            },
        );
        Ok(Box::new(MemorySubscription {
            id,
            state: Arc::downgrade(&self.state),
        }))
    }
}

struct MemorySubscription {
    id: u64,
    state: Weak<Mutex<State>>,
}

impl Subscription for MemorySubscription {
    fn cancel(self: Box<Self>) {
        // Removal happens in Drop.
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .subscriptions
                .remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;
    use std::time::Duration;

    const NS: &str = r"root\virtualization\v2";

    fn vm(name: &str) -> CimInstance {
        CimInstance::new("Msvm_ComputerSystem")
            .with_key("CreationClassName", "Msvm_ComputerSystem")
            .with_key("Name", name)
            .with_property("EnabledState", 2u16)
    }

    #[test]
    fn test_get_and_count() {
        let store = MemoryStore::new("HOST1");
        let path = store.insert(NS, vm("A")).unwrap();
        assert_eq!(store.get_instance(&path).unwrap().class_name(), "Msvm_ComputerSystem");
        assert_eq!(store.call_count(StoreCall::GetInstance), 1);

        store.remove(&path);
        assert_eq!(store.get_instance(&path), Err(StoreError::not_found(&path)));
    }

    #[test]
    fn test_injected_failure_is_used_once() {
        let store = MemoryStore::new("HOST1");
        let path = store.insert(NS, vm("A")).unwrap();
        store.fail_next(
            StoreCall::GetInstance,
            StoreError::call_failed(FailureReason::RpcServerUnavailable, "down"),
        );
        assert!(matches!(
            store.get_instance(&path),
            Err(StoreError::CallFailed { .. })
        ));
        assert!(store.get_instance(&path).is_ok());
    }

    #[test]
    fn test_subclass_lookup() {
        let store = MemoryStore::new("HOST1");
        store.declare_subclass("Msvm_ComputerSystem", "CIM_ComputerSystem");
        let path = store.insert(NS, vm("A")).unwrap();
        let base = path.clone().with_class("CIM_ComputerSystem");
        assert_eq!(
            store.get_instance(&base).unwrap().class_name(),
            "Msvm_ComputerSystem"
        );
        assert_eq!(store.enumerate_instances(NS, "CIM_ComputerSystem").unwrap().len(), 1);
    }

    #[test]
    fn test_associators_respect_roles_and_result_class() {
        let store = MemoryStore::new("HOST1");
        let vm_path = store.insert(NS, vm("A")).unwrap();
        let setting = CimInstance::new("Msvm_VirtualSystemSettingData")
            .with_key("InstanceID", "Microsoft:A");
        let setting_path = store.insert(NS, setting).unwrap();
        store.link(
            "Msvm_SettingsDefineState",
            ("ManagedElement", &vm_path),
            ("SettingData", &setting_path),
        );

        let assoc = Association::to_class(
            "Msvm_SettingsDefineState",
            "Msvm_VirtualSystemSettingData",
            Some("SettingData"),
        );
        let found = store.enumerate_associated_instances(&vm_path, &assoc).unwrap();
        assert_eq!(found.len(), 1);

        let wrong_role = Association::new("Msvm_SettingsDefineState")
            .with_roles(None, Some("ManagedElement"));
        assert!(store
            .enumerate_associated_instances(&vm_path, &wrong_role)
            .unwrap()
            .is_empty());

        // Traversal works in both directions.
        let back = Association::new("Msvm_SettingsDefineState");
        assert_eq!(
            store
                .enumerate_associated_instances(&setting_path, &back)
                .unwrap()[0]
                .class_name(),
            "Msvm_ComputerSystem"
        );
    }

    #[test]
    fn test_events_reach_subscribers_until_dropped() {
        let store = MemoryStore::new("HOST1");
        let path = store.insert(NS, vm("A")).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let query = EventQuery::new(
            InstanceEventKind::Modification,
            "Msvm_ComputerSystem",
            Duration::from_secs(2),
        );
        let sub = store
            .subscribe(
                NS,
                &query,
                Arc::new(move |e: InstanceEvent| sink_seen.lock().unwrap().push(e)),
            )
            .unwrap();
        assert_eq!(store.subscription_count(), 1);

        store.set_property(&path, "EnabledState", 3u16).unwrap();
        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(
                seen[0].previous.as_ref().and_then(|p| p.property("EnabledState").cloned()),
                Some(CimValue::UInt(2))
            );
        }

        sub.cancel();
        assert_eq!(store.subscription_count(), 0);
        store.set_property(&path, "EnabledState", 2u16).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_method_routing() {
        let store = MemoryStore::new("HOST1");
        let path = store.insert(NS, vm("A")).unwrap();
        store.on_method("Msvm_ComputerSystem", "RequestStateChange", |s, p, args| {
            let state: u16 = args.get("RequestedState").and_then(|v| v.get()).unwrap_or(0);
            s.set_property(p, "EnabledState", state)?;
            Ok(MethodResult::success())
        });
        let args = PropertyMap::new().with("RequestedState", 3u16);
        let result = store.invoke_method(&path, "requeststatechange", &args).unwrap();
        assert_eq!(result.return_value, 0);
        assert_eq!(
            store.get_instance(&path).unwrap().property("EnabledState"),
            Some(&CimValue::UInt(3))
        );
        assert!(matches!(
            store.invoke_method(&path, "Frobnicate", &args),
            Err(StoreError::MethodNotFound { .. })
        ));
    }

    #[test]
    fn test_jobs() {
        let store = MemoryStore::new("HOST1");
        let job = store.create_job(NS, "Start").unwrap();
        store.finish_job(&job, 10, 32769, "Access denied", "").unwrap();
        let inst = store.get_instance(&job).unwrap();
        assert_eq!(inst.property("JobState"), Some(&CimValue::UInt(10)));
        assert_eq!(inst.property("ErrorCode"), Some(&CimValue::UInt(32769)));
    }
}
