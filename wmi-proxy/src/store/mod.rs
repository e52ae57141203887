//! The remote instance store consumed by the cache.
//!
//! Implementations wrap a CIM/WMI session. [`MemoryStore`] is an in-process
//! implementation for tests and demos.

mod memory;

use core::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::association::Association;
use crate::error::StoreResult;
use crate::object::{CimInstance, CimValue, PropertyMap, WmiObjectPath};

pub use memory::{MemoryStore, MethodHandler, StoreCall};

/// Method return value meaning the call completed synchronously.
pub const RETURN_SUCCESS: u32 = 0;

/// Method return value meaning the call continues as a job.
pub const RETURN_JOB_STARTED: u32 = 4096;

/// Return value and out parameters of a method invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodResult {
    pub return_value: u32,
    pub out_params: PropertyMap,
}

impl MethodResult {
    pub fn new(return_value: u32) -> Self {
        Self {
            return_value,
            out_params: PropertyMap::new(),
        }
    }

    pub fn success() -> Self {
        Self::new(RETURN_SUCCESS)
    }

    /// Result announcing a job, with the job path in the `Job` out parameter.
    pub fn job_started(job: WmiObjectPath) -> Self {
        Self::new(RETURN_JOB_STARTED).with_out("Job", job)
    }

    pub fn with_out(mut self, name: &str, value: impl Into<CimValue>) -> Self {
        self.out_params.insert(name, value);
        self
    }

    pub fn out(&self, name: &str) -> Option<&CimValue> {
        self.out_params.get(name)
    }

    pub fn job_path(&self) -> Option<WmiObjectPath> {
        self.out("Job").and_then(|v| v.get::<WmiObjectPath>())
    }
}

/// Kind of instance lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceEventKind {
    Creation,
    Modification,
    Deletion,
}

impl InstanceEventKind {
    /// WMI intrinsic event class.
    pub fn event_class(&self) -> &'static str {
        match self {
            InstanceEventKind::Creation => "__InstanceCreationEvent",
            InstanceEventKind::Modification => "__InstanceModificationEvent",
            InstanceEventKind::Deletion => "__InstanceDeletionEvent",
        }
    }
}

impl fmt::Display for InstanceEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceEventKind::Creation => f.write_str("creation"),
            InstanceEventKind::Modification => f.write_str("modification"),
            InstanceEventKind::Deletion => f.write_str("deletion"),
        }
    }
}

/// An arrived instance event.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceEvent {
    pub kind: InstanceEventKind,
    pub target: CimInstance,
    /// Prior state, only present on modification events.
    pub previous: Option<CimInstance>,
}

impl InstanceEvent {
    pub fn new(kind: InstanceEventKind, target: CimInstance) -> Self {
        Self {
            kind,
            target,
            previous: None,
        }
    }
}

/// Intrinsic event query for one class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventQuery {
    pub kind: InstanceEventKind,
    pub class_name: String,
    pub polling_interval: Duration,
    /// Extra `AND` conditions on the target instance.
    pub conditions: Vec<String>,
}

impl EventQuery {
    pub fn new(kind: InstanceEventKind, class_name: &str, polling_interval: Duration) -> Self {
        Self {
            kind,
            class_name: class_name.to_string(),
            polling_interval,
            conditions: Vec::new(),
        }
    }
}

impl fmt::Display for EventQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let within = self.polling_interval.as_secs().max(1);
        write!(
            f,
            "SELECT * FROM {} WITHIN {} WHERE TargetInstance ISA '{}'",
            self.kind.event_class(),
            within,
            self.class_name
        )?;
        for cond in &self.conditions {
            write!(f, " AND {cond}")?;
        }
        Ok(())
    }
}

/// Callback the store invokes for every arrived event.
pub type EventSink = Arc<dyn Fn(InstanceEvent) + Send + Sync>;

/// Live event subscription. `cancel` stops delivery to the sink.
pub trait Subscription: Send {
    fn cancel(self: Box<Self>);
}

/// Minimal contract of a remote CIM/WMI session.
pub trait InstanceStore: Send + Sync {
    /// Name of the server this store talks to.
    fn server_name(&self) -> &str;

    fn get_instance(&self, path: &WmiObjectPath) -> StoreResult<CimInstance>;

    fn enumerate_instances(&self, namespace: &str, class_name: &str)
        -> StoreResult<Vec<CimInstance>>;

    fn enumerate_associated_instances(
        &self,
        source: &WmiObjectPath,
        association: &Association,
    ) -> StoreResult<Vec<CimInstance>>;

    /// Write `changes`, returning the instance as confirmed by the server.
    fn modify_instance(
        &self,
        path: &WmiObjectPath,
        changes: &PropertyMap,
    ) -> StoreResult<CimInstance>;

    fn invoke_method(
        &self,
        path: &WmiObjectPath,
        method: &str,
        args: &PropertyMap,
    ) -> StoreResult<MethodResult>;

    fn subscribe(
        &self,
        namespace: &str,
        query: &EventQuery,
        sink: EventSink,
    ) -> StoreResult<Box<dyn Subscription>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_query_wql() {
        let mut q = EventQuery::new(
            InstanceEventKind::Modification,
            "Msvm_ComputerSystem",
            Duration::from_secs(2),
        );
        assert_eq!(
            q.to_string(),
            "SELECT * FROM __InstanceModificationEvent WITHIN 2 WHERE TargetInstance ISA 'Msvm_ComputerSystem'"
        );
        q.conditions.push("TargetInstance.EnabledState = 2".to_string());
        assert!(q.to_string().ends_with(" AND TargetInstance.EnabledState = 2"));
    }

    #[test]
    fn test_method_result_job_path() {
        let job = WmiObjectPath::new("H", "ns", "Msvm_ConcreteJob").with_key("InstanceID", "j1");
        let result = MethodResult::job_started(job.clone());
        assert_eq!(result.return_value, RETURN_JOB_STARTED);
        assert_eq!(result.job_path(), Some(job));
        assert_eq!(MethodResult::success().job_path(), None);
    }
}
