use core::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use super::registry::TypedView;
use crate::association::Association;
use crate::error::{Error, FailureReason, Result};
use crate::object::{CimValue, FromCimValue, ObjectKey, PropertyMap, WmiObjectPath};
use crate::proxy::Proxy;
use crate::server::Server;
use crate::store::{MethodResult, RETURN_JOB_STARTED, RETURN_SUCCESS};
use crate::task::{
    CompletedTask, ErrorCodeMapper, Failure, GenericErrorCodeMapper, Operation,
    ServerProvidedMessageMapper, Task, TaskStatus, ERROR_NOT_SUPPORTED, ERROR_RESULT_NOT_FOUND,
};

/// Where a view stands with respect to its staged property changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutState {
    /// No staged changes.
    Clean,
    /// Changes staged with `set_property`.
    Dirty,
    /// A Put was started and not yet ended.
    Putting,
}

#[derive(Default)]
struct Pending {
    changes: PropertyMap,
    /// Put tasks handed out and not yet dropped.
    in_flight: usize,
}

/// Held by a Put task; the view leaves `Putting` once every ticket is gone.
struct PutTicket(Weak<Mutex<Pending>>);

impl Drop for PutTicket {
    fn drop(&mut self) {
        if let Some(pending) = self.0.upgrade() {
            let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.in_flight = pending.in_flight.saturating_sub(1);
        }
    }
}

/// Typed façade over a [`Proxy`].
///
/// Reads go through the shared proxy cache. Writes are staged on the view
/// and sent with [`put`](Self::put).
pub struct View {
    server: Arc<Server>,
    proxy: Arc<Proxy>,
    pending: Arc<Mutex<Pending>>,
    mapper: Arc<dyn ErrorCodeMapper>,
}

impl View {
    pub(crate) fn new(server: Arc<Server>, proxy: Arc<Proxy>) -> Self {
        Self {
            server,
            proxy,
            pending: Arc::new(Mutex::new(Pending::default())),
            mapper: Arc::new(GenericErrorCodeMapper),
        }
    }

    /// Use `mapper` to word failures that carry no server text.
    pub fn with_mapper(mut self, mapper: Arc<dyn ErrorCodeMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &ObjectKey {
        self.proxy.key()
    }

    pub fn path(&self) -> &WmiObjectPath {
        self.proxy.key().path()
    }

    pub fn class_name(&self) -> &str {
        self.proxy.key().class_name()
    }

    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn is_deleted(&self) -> bool {
        self.proxy.is_deleted()
    }

    /// Property `name` as `T`, preferring a staged value.
    ///
    /// A value that does not convert to `T` fails with
    /// `InvalidPropertyValue`; read nullable properties as `Option<T>`.
    pub fn get_property<T: FromCimValue>(&self, name: &str) -> Result<T> {
        let staged = self.lock().changes.get(name).cloned();
        let value = match staged {
            Some(value) => value,
            None => self.proxy.get_property(name)?,
        };
        value.get::<T>().ok_or_else(|| Error::InvalidPropertyValue {
            property: name.to_string(),
            expected: T::TYPE_NAME,
            value: value.to_string(),
        })
    }

    /// Like [`get_property`](Self::get_property), with `default` when the
    /// class has no such property.
    pub fn get_property_or<T: FromCimValue>(&self, name: &str, default: T) -> Result<T> {
        if !self.does_property_exist(name)? {
            return Ok(default);
        }
        self.get_property(name)
    }

    pub fn does_property_exist(&self, name: &str) -> Result<bool> {
        self.proxy.does_property_exist(name)
    }

    /// Staged and cached property names.
    pub fn property_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.lock().changes.names().map(str::to_string).collect();
        for name in self.proxy.property_names()? {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(&name)) {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Stage a change; nothing is sent until [`put`](Self::put).
    pub fn set_property(&self, name: &str, value: impl Into<CimValue>) {
        self.lock().changes.insert(name, value);
    }

    pub fn discard_pending_changes(&self) {
        self.lock().changes.clear();
    }

    pub fn pending_changes(&self) -> PropertyMap {
        self.lock().changes.clone()
    }

    pub fn put_state(&self) -> PutState {
        let pending = self.lock();
        if pending.in_flight > 0 {
            PutState::Putting
        } else if pending.changes.is_empty() {
            PutState::Clean
        } else {
            PutState::Dirty
        }
    }

    pub fn update_property_cache(&self, threshold: Duration) -> Result<()> {
        self.proxy.update_property_cache(threshold)
    }

    pub fn invalidate_property_cache(&self) {
        self.proxy.invalidate_property_cache();
    }

    /// Send staged changes and wait for the outcome.
    pub fn put(&self) -> Result<()> {
        let task = self.begin_put();
        task.wait_for_completion(None)?;
        self.end_put(task)
    }

    /// Start sending staged changes. With nothing staged the returned task
    /// is already complete and no remote call is made.
    ///
    /// The view reports `Putting` until the task is passed to
    /// [`end_put`](Self::end_put) or dropped.
    pub fn begin_put(&self) -> Task {
        let changes = {
            let mut pending = self.lock();
            if pending.changes.is_empty() {
                return CompletedTask::success().into();
            }
            pending.in_flight += 1;
            pending.changes.clone()
        };
        let ticket = Box::new(PutTicket(Arc::downgrade(&self.pending)));
        tracing::info!(
            path = %self.key(),
            properties = %serde_json::to_string(&changes).unwrap_or_default(),
            "beginning put"
        );
        match self.proxy.put_properties(&changes) {
            Ok(_) => CompletedTask::success()
                .with_put_properties(changes)
                .with_guard(ticket)
                .into(),
            Err(e) => CompletedTask::from_error(e)
                .with_put_properties(changes)
                .with_guard(ticket)
                .into(),
        }
    }

    /// Finish a Put started with [`begin_put`](Self::begin_put).
    ///
    /// On success, a staged change is cleared only if it still holds the
    /// value that was sent. On failure the staged changes stay for a retry.
    pub fn end_put(&self, task: Task) -> Result<()> {
        if !task.is_completed() {
            return Err(Error::TaskNotCompleted);
        }

        if task.error_code() == 0 {
            if let Some(sent) = task.put_properties() {
                let mut pending = self.lock();
                for (name, value) in sent.iter() {
                    if pending.changes.get(name) == Some(value) {
                        pending.changes.remove(name);
                    }
                }
            }
            tracing::info!(path = %self.key(), "put completed");
            return Ok(());
        }

        let canceled = task.status() == TaskStatus::Canceled;
        let info = task.error_information();
        let mut source = task.into_wrapped_error();
        if info.error_code == ERROR_NOT_SUPPORTED
            && matches!(
                source,
                Some(Error::RemoteCallFailed {
                    reason: FailureReason::NotSupported,
                    ..
                })
            )
        {
            source = None;
        }
        let mapper: &dyn ErrorCodeMapper = if info.server_provided {
            &ServerProvidedMessageMapper
        } else {
            self.mapper.as_ref()
        };
        Err(Failure {
            operation: Operation::Put,
            error_code: info.error_code,
            summary: info.summary.as_deref(),
            details: info.details.as_deref(),
            canceled,
        }
        .into_error(mapper, Some(self.key().to_string()), source))
    }

    /// Keys of objects related through `association`, from cache when present.
    pub fn get_related_object_keys(&self, association: &Association) -> Result<Vec<ObjectKey>> {
        self.proxy.get_related_object_keys(association, Duration::MAX)
    }

    /// Related objects of type `T`. Objects of other types are skipped, as
    /// are objects that can no longer be resolved.
    pub fn get_related_objects<T: TypedView>(&self, association: &Association) -> Result<Vec<T>> {
        let keys = self.get_related_object_keys(association)?;
        let mut related = Vec::with_capacity(keys.len());
        for key in keys {
            match self.server.get_object(&key) {
                Ok(object) => {
                    if let Ok(typed) = object.into_any().downcast::<T>() {
                        related.push(*typed);
                    }
                }
                Err(e) => {
                    tracing::error!(path = %key, error = %e, "failed to resolve related object");
                }
            }
        }
        Ok(related)
    }

    /// First related object of type `T`. With `required`, finding none
    /// fails with `RelatedObjectNotFound`.
    pub fn get_related_object<T: TypedView>(
        &self,
        association: &Association,
        required: bool,
    ) -> Result<Option<T>> {
        let found = self.get_related_objects::<T>(association)?.into_iter().next();
        if found.is_none() && required {
            return Err(Error::RelatedObjectNotFound {
                path: self.key().to_string(),
                association: association.to_string(),
                class_name: T::CLASS_NAME.to_string(),
            });
        }
        Ok(found)
    }

    pub fn invoke_method(&self, method: &str, args: &PropertyMap) -> Result<MethodResult> {
        self.proxy.invoke_method(method, args)
    }

    /// Turn a method's return into a task.
    ///
    /// Success yields a completed task holding the objects named by the
    /// `affected_param` out parameter, a job return yields the job's task,
    /// and any other return value a completed task with that error code.
    pub fn begin_method_task_return(
        &self,
        result: &MethodResult,
        affected_param: Option<&str>,
    ) -> Result<Task> {
        match result.return_value {
            RETURN_SUCCESS => {
                let affected = match affected_param.and_then(|name| result.out(name)) {
                    Some(value) => self.affected_keys(value)?,
                    None => Vec::new(),
                };
                Ok(CompletedTask::with_affected(affected).into())
            }
            RETURN_JOB_STARTED => {
                let job = result.job_path().ok_or_else(|| Error::RemoteCallFailed {
                    server: self.key().server().to_string(),
                    reason: FailureReason::ProviderFailure,
                    message: "method started a job but returned no job reference".to_string(),
                })?;
                self.server.task_from_path(&job)
            }
            code => Ok(CompletedTask::from_code(i64::from(code)).into()),
        }
    }

    fn affected_keys(&self, value: &CimValue) -> Result<Vec<ObjectKey>> {
        let paths = match value {
            CimValue::Null => Vec::new(),
            CimValue::Array(_) => value.get::<Vec<WmiObjectPath>>().ok_or_else(|| {
                Error::InvalidPropertyValue {
                    property: "affected element".to_string(),
                    expected: "object path array",
                    value: value.to_string(),
                }
            })?,
            single => vec![single.get::<WmiObjectPath>().ok_or_else(|| {
                Error::InvalidPropertyValue {
                    property: "affected element".to_string(),
                    expected: "object path",
                    value: single.to_string(),
                }
            })?],
        };
        paths
            .into_iter()
            .map(|path| self.server.object_key(&path))
            .collect()
    }

    /// Wait for `task` and fail with `OperationFailed` unless it succeeded.
    pub fn end_method(&self, task: Task, operation: Operation) -> Result<()> {
        self.finish(task, operation).map(|_| ())
    }

    /// Like [`end_method`](Self::end_method), returning the first affected
    /// object of type `T`. With `required`, finding none fails with error
    /// code -2.
    pub fn end_method_return<T: TypedView>(
        &self,
        task: Task,
        operation: Operation,
        required: bool,
    ) -> Result<Option<T>> {
        let client_message = task.client_side_failed_message();
        let found = self
            .end_method_return_enumeration::<T>(task, operation)?
            .into_iter()
            .next();
        if found.is_none() && required {
            return Err(Failure {
                operation,
                error_code: ERROR_RESULT_NOT_FOUND,
                summary: client_message.as_deref(),
                details: None,
                canceled: false,
            }
            .into_error(self.mapper.as_ref(), Some(self.key().to_string()), None));
        }
        Ok(found)
    }

    /// All affected objects of type `T`.
    pub fn end_method_return_enumeration<T: TypedView>(
        &self,
        task: Task,
        operation: Operation,
    ) -> Result<Vec<T>> {
        let keys = self.finish(task, operation)?;
        let mut affected = Vec::with_capacity(keys.len());
        for key in keys {
            match self.server.get_object(&key) {
                Ok(object) => {
                    if let Ok(typed) = object.into_any().downcast::<T>() {
                        affected.push(*typed);
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %key, error = %e, "affected element could not be resolved");
                }
            }
        }
        Ok(affected)
    }

    fn finish(&self, task: Task, operation: Operation) -> Result<Vec<ObjectKey>> {
        if !task.wait_for_completion(None)? {
            return Err(Error::TaskNotCompleted);
        }
        if task.status() != TaskStatus::CompletedSuccessfully {
            return Err(self.task_failure(task, operation));
        }
        task.update_affected_elements()?;
        task.affected_elements()
    }

    fn task_failure(&self, task: Task, operation: Operation) -> Error {
        let canceled = task.status() == TaskStatus::Canceled;
        let info = task.error_information();
        let mapper: &dyn ErrorCodeMapper = if info.server_provided {
            &ServerProvidedMessageMapper
        } else {
            self.mapper.as_ref()
        };
        Failure {
            operation,
            error_code: info.error_code,
            summary: info.summary.as_deref(),
            details: info.details.as_deref(),
            canceled,
        }
        .into_error(mapper, Some(self.key().to_string()), None)
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("path", self.key())
            .field("put_state", &self.put_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::object::CimInstance;
    use crate::server::DEFAULT_NAMESPACE as NS;
    use crate::store::{MemoryStore, StoreCall};
    use crate::view::ManagementObject;

    fn setup() -> (MemoryStore, Arc<Server>, ObjectKey) {
        let store = MemoryStore::new("HOST1");
        let server = Server::with_defaults(Arc::new(store.clone())).unwrap();
        let path = store
            .insert(
                NS,
                CimInstance::new("Msvm_ComputerSystem")
                    .with_key("CreationClassName", "Msvm_ComputerSystem")
                    .with_key("Name", "A")
                    .with_property("ElementName", "web01")
                    .with_property("EnabledState", 2u16)
                    .with_property("Description", CimValue::Null),
            )
            .unwrap();
        (store, server, ObjectKey::new(path).unwrap())
    }

    fn object(server: &Arc<Server>, key: &ObjectKey) -> Box<dyn ManagementObject> {
        server.get_object(key).unwrap()
    }

    #[test]
    fn test_staged_value_wins_until_discarded() {
        let (_, server, key) = setup();
        let object = object(&server, &key);
        let view = object.view();

        view.set_property("ElementName", "web02");
        assert_eq!(view.get_property::<String>("ElementName").unwrap(), "web02");
        assert_eq!(view.put_state(), PutState::Dirty);

        view.discard_pending_changes();
        assert_eq!(view.get_property::<String>("ElementName").unwrap(), "web01");
        assert_eq!(view.put_state(), PutState::Clean);
    }

    #[test]
    fn test_dropped_put_task_leaves_putting() {
        let (_, server, key) = setup();
        let object = object(&server, &key);
        let view = object.view();

        view.set_property("ElementName", "web02");
        let task = view.begin_put();
        assert_eq!(view.put_state(), PutState::Putting);
        drop(task);
        assert_eq!(view.put_state(), PutState::Dirty);

        let task = view.begin_put();
        view.end_put(task).unwrap();
        assert_eq!(view.put_state(), PutState::Clean);
    }

    #[test]
    fn test_typed_reads() {
        let (_, server, key) = setup();
        let object = object(&server, &key);
        let view = object.view();

        let err = view.get_property::<bool>("ElementName").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidPropertyValue);

        let err = view.get_property::<String>("Description").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidPropertyValue);
        assert_eq!(view.get_property::<Option<String>>("Description").unwrap(), None);

        assert_eq!(view.get_property_or("Notes", 7u32).unwrap(), 7);
        let err = view.get_property::<u32>("Notes").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ClassDefinitionMismatch);
    }

    #[test]
    fn test_property_names_include_staged() {
        let (_, server, key) = setup();
        let object = object(&server, &key);
        let view = object.view();
        view.set_property("Notes", "staged");
        view.set_property("elementname", "web03");

        let names = view.property_names().unwrap();
        assert!(names.iter().any(|n| n == "Notes"));
        assert_eq!(
            names
                .iter()
                .filter(|n| n.eq_ignore_ascii_case("ElementName"))
                .count(),
            1
        );
    }

    #[test]
    fn test_job_return_follows_job() {
        let (store, server, key) = setup();
        let object = object(&server, &key);
        let job = store.create_job(NS, "Modify").unwrap();

        let result = MethodResult::new(RETURN_JOB_STARTED).with_out("Job", job);
        let task = object.view().begin_method_task_return(&result, None).unwrap();
        assert_eq!(task.status(), TaskStatus::Running);
    }

    #[test]
    fn test_method_return_codes_become_tasks() {
        let (store, server, key) = setup();
        let object = object(&server, &key);
        let view = object.view();

        let task = view
            .begin_method_task_return(&MethodResult::new(32773), None)
            .unwrap();
        assert_eq!(task.status(), TaskStatus::CompletedWithErrors);
        let err = view.end_method(task, Operation::Method("AddResourceSettings")).err().unwrap();
        match err {
            Error::OperationFailed(e) => {
                assert_eq!(e.error_code, 32773);
                assert_eq!(
                    e.message,
                    "AddResourceSettings failed: invalid parameter (32773)"
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let result = MethodResult::success().with_out("ResultingSystem", key.path().clone());
        let task = view
            .begin_method_task_return(&result, Some("ResultingSystem"))
            .unwrap();
        assert_eq!(task.affected_elements().unwrap(), vec![key.clone()]);
        assert_eq!(store.call_count(StoreCall::InvokeMethod), 0);
    }

    #[test]
    fn test_job_start_without_reference_fails() {
        let (_, server, key) = setup();
        let object = object(&server, &key);
        let err = object
            .view()
            .begin_method_task_return(&MethodResult::new(RETURN_JOB_STARTED), None)
            .err()
            .unwrap();
        assert_eq!(err.failure_reason(), Some(FailureReason::ProviderFailure));
    }
}
