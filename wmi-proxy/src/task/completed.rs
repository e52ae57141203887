use std::any::Any;
use std::time::Duration;

use uuid::Uuid;

use super::mapper::ERROR_RESULT_NOT_FOUND;
use super::TaskStatus;
use crate::error::{Error, FailureReason};
use crate::object::{ObjectKey, PropertyMap};

/// Generic failure code reported for a wrapped error.
pub const ERROR_FAILED: i64 = 32768;

/// Failure code reported when the server does not support the call.
pub const ERROR_NOT_SUPPORTED: i64 = 32770;

/// A task whose outcome was known when it was created.
#[derive(Debug)]
pub struct CompletedTask {
    instance_id: Uuid,
    error_code: i64,
    summary: Option<String>,
    details: Option<String>,
    affected: Vec<ObjectKey>,
    wrapped: Option<Error>,
    put_properties: Option<PropertyMap>,
    client_side_failed_message: Option<String>,
    /// Released when the task is dropped.
    guard: Option<Box<dyn Any + Send + Sync>>,
}

impl CompletedTask {
    fn with_code(error_code: i64) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            error_code,
            summary: None,
            details: None,
            affected: Vec::new(),
            wrapped: None,
            put_properties: None,
            client_side_failed_message: None,
            guard: None,
        }
    }

    pub fn success() -> Self {
        Self::with_code(0)
    }

    /// Successful task that produced `affected`.
    pub fn with_affected(affected: Vec<ObjectKey>) -> Self {
        Self {
            affected,
            ..Self::success()
        }
    }

    /// Task that failed on the server with `error_code`.
    pub fn from_code(error_code: i64) -> Self {
        Self::with_code(error_code)
    }

    /// Task carrying an error raised while starting the operation.
    pub fn from_error(error: Error) -> Self {
        let (error_code, details) = match &error {
            Error::OperationFailed(e) => (e.error_code, e.details.clone()),
            Error::RemoteCallFailed {
                reason: FailureReason::NotSupported,
                ..
            } => (ERROR_NOT_SUPPORTED, None),
            _ => (ERROR_FAILED, None),
        };
        Self {
            summary: Some(error.summary()),
            details,
            wrapped: Some(error),
            ..Self::with_code(error_code)
        }
    }

    /// Task that failed on the client side without a server error.
    pub fn client_failure(message: impl Into<String>) -> Self {
        Self {
            client_side_failed_message: Some(message.into()),
            ..Self::with_code(ERROR_RESULT_NOT_FOUND)
        }
    }

    pub fn with_put_properties(mut self, properties: PropertyMap) -> Self {
        self.put_properties = Some(properties);
        self
    }

    /// Keep `guard` alive for as long as this task.
    pub(crate) fn with_guard(mut self, guard: Box<dyn Any + Send + Sync>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn status(&self) -> TaskStatus {
        if self.error_code == 0 {
            TaskStatus::CompletedSuccessfully
        } else {
            TaskStatus::CompletedWithErrors
        }
    }

    pub fn percent_complete(&self) -> u16 {
        100
    }

    pub fn elapsed_time(&self) -> Duration {
        Duration::ZERO
    }

    pub fn error_code(&self) -> i64 {
        self.error_code
    }

    pub fn error_summary_description(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn error_details_description(&self) -> Option<&str> {
        self.details.as_deref()
    }

    pub fn affected_elements(&self) -> &[ObjectKey] {
        &self.affected
    }

    pub fn instance_id(&self) -> String {
        self.instance_id.to_string()
    }

    /// The error this task was built from, if any.
    pub fn error(&self) -> Option<&Error> {
        self.wrapped.as_ref()
    }

    pub fn into_error(self) -> Option<Error> {
        self.wrapped
    }

    pub fn put_properties(&self) -> Option<&PropertyMap> {
        self.put_properties.as_ref()
    }

    pub fn client_side_failed_message(&self) -> Option<&str> {
        self.client_side_failed_message.as_deref()
    }

    pub fn set_client_side_failed_message(&mut self, message: impl Into<String>) {
        self.client_side_failed_message = Some(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OperationFailedError;
    use crate::task::Operation;

    #[test]
    fn test_success_is_complete() {
        let task = CompletedTask::success();
        assert_eq!(task.status(), TaskStatus::CompletedSuccessfully);
        assert_eq!(task.percent_complete(), 100);
        assert_eq!(task.elapsed_time(), Duration::ZERO);
        assert!(task.affected_elements().is_empty());
        assert!(task.error().is_none());
    }

    #[test]
    fn test_from_code() {
        let task = CompletedTask::from_code(32773);
        assert_eq!(task.status(), TaskStatus::CompletedWithErrors);
        assert_eq!(task.error_code(), 32773);
        assert_eq!(task.error_summary_description(), None);
    }

    #[test]
    fn test_from_error_codes() {
        let generic = CompletedTask::from_error(Error::TaskNotCompleted);
        assert_eq!(generic.error_code(), ERROR_FAILED);
        assert_eq!(
            generic.error_summary_description(),
            Some("task has not completed yet")
        );

        let unsupported = CompletedTask::from_error(Error::RemoteCallFailed {
            server: "HOST1".to_string(),
            reason: FailureReason::NotSupported,
            message: "no".to_string(),
        });
        assert_eq!(unsupported.error_code(), ERROR_NOT_SUPPORTED);

        let failed = CompletedTask::from_error(Error::OperationFailed(OperationFailedError {
            operation: Operation::Put,
            error_code: 32775,
            message: "Invalid state".to_string(),
            details: Some("The VM is running.".to_string()),
            canceled: false,
            object_path: None,
            source: None,
        }));
        assert_eq!(failed.error_code(), 32775);
        assert_eq!(failed.error_summary_description(), Some("Invalid state"));
        assert_eq!(failed.error_details_description(), Some("The VM is running."));
        assert!(failed.into_error().is_some());
    }

    #[test]
    fn test_client_failure() {
        let task = CompletedTask::client_failure("Device was added but not found.");
        assert_eq!(task.status(), TaskStatus::CompletedWithErrors);
        assert_eq!(task.error_code(), ERROR_RESULT_NOT_FOUND);
        assert_eq!(
            task.client_side_failed_message(),
            Some("Device was added but not found.")
        );
    }
}
