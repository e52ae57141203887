//! Outcomes of remote operations: finished results and running jobs.

mod completed;
mod job;
mod mapper;

use core::fmt;
use std::time::Duration;

pub use completed::{CompletedTask, ERROR_FAILED, ERROR_NOT_SUPPORTED};
pub use job::{
    JobProgress, JobState, JobTask, JobWaitConfig, DEFAULT_JOB_TIMEOUT, DEFAULT_POLL_INTERVAL,
};
pub(crate) use mapper::Failure;
pub use mapper::{
    return_code_text, ErrorCodeMapper, GenericErrorCodeMapper, Operation,
    ServerProvidedMessageMapper, ShutdownErrorCodeMapper, ERROR_JOB_DELETED,
    ERROR_RESULT_NOT_FOUND, ERROR_SERVER_DISCONNECTED,
};

use crate::error::{Error, Result};
use crate::object::{ObjectKey, PropertyMap};

/// Where a task stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Running,
    CompletedSuccessfully,
    CompletedWithErrors,
    Canceled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Running => "Running",
            TaskStatus::CompletedSuccessfully => "CompletedSuccessfully",
            TaskStatus::CompletedWithErrors => "CompletedWithErrors",
            TaskStatus::Canceled => "Canceled",
        };
        f.write_str(s)
    }
}

/// Error text and code gathered from a failed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInformation {
    pub error_code: i64,
    pub summary: Option<String>,
    pub details: Option<String>,
    /// The text came from the server rather than the client.
    pub server_provided: bool,
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.trim().is_empty())
}

/// The outcome of an asynchronous operation.
#[derive(Debug)]
pub enum Task {
    Completed(CompletedTask),
    Job(JobTask),
}

impl From<CompletedTask> for Task {
    fn from(task: CompletedTask) -> Self {
        Task::Completed(task)
    }
}

impl From<JobTask> for Task {
    fn from(task: JobTask) -> Self {
        Task::Job(task)
    }
}

impl Task {
    pub fn status(&self) -> TaskStatus {
        match self {
            Task::Completed(t) => t.status(),
            Task::Job(t) => t.status(),
        }
    }

    pub fn is_completed(&self) -> bool {
        match self {
            Task::Completed(_) => true,
            Task::Job(t) => t.is_completed(),
        }
    }

    pub fn percent_complete(&self) -> u16 {
        match self {
            Task::Completed(t) => t.percent_complete(),
            Task::Job(t) => t.percent_complete(),
        }
    }

    pub fn elapsed_time(&self) -> Duration {
        match self {
            Task::Completed(t) => t.elapsed_time(),
            Task::Job(t) => t.elapsed_time(),
        }
    }

    pub fn error_code(&self) -> i64 {
        match self {
            Task::Completed(t) => t.error_code(),
            Task::Job(t) => t.error_code(),
        }
    }

    pub fn error_summary_description(&self) -> Option<String> {
        match self {
            Task::Completed(t) => t.error_summary_description().map(str::to_string),
            Task::Job(t) => t.error_summary_description(),
        }
    }

    pub fn error_details_description(&self) -> Option<String> {
        match self {
            Task::Completed(t) => t.error_details_description().map(str::to_string),
            Task::Job(t) => t.error_details_description(),
        }
    }

    pub fn client_side_failed_message(&self) -> Option<String> {
        match self {
            Task::Completed(t) => t.client_side_failed_message().map(str::to_string),
            Task::Job(t) => t.client_side_failed_message(),
        }
    }

    /// Message used when the task fails without server-provided text.
    pub fn set_client_side_failed_message(&mut self, message: impl Into<String>) {
        match self {
            Task::Completed(t) => t.set_client_side_failed_message(message),
            Task::Job(t) => t.set_client_side_failed_message(message),
        }
    }

    /// Property values sent by the Put this task tracks.
    pub fn put_properties(&self) -> Option<PropertyMap> {
        match self {
            Task::Completed(t) => t.put_properties().cloned(),
            Task::Job(t) => t.put_properties(),
        }
    }

    pub fn instance_id(&self) -> String {
        match self {
            Task::Completed(t) => t.instance_id(),
            Task::Job(t) => t.instance_id(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Task::Completed(_) => String::new(),
            Task::Job(t) => t.name(),
        }
    }

    pub fn cancelable(&self) -> bool {
        match self {
            Task::Completed(_) => false,
            Task::Job(t) => t.cancelable(),
        }
    }

    pub fn completed_with_warnings(&self) -> bool {
        match self {
            Task::Completed(_) => false,
            Task::Job(t) => t.completed_with_warnings(),
        }
    }

    pub fn affected_elements(&self) -> Result<Vec<ObjectKey>> {
        match self {
            Task::Completed(t) => Ok(t.affected_elements().to_vec()),
            Task::Job(t) => t.affected_elements(),
        }
    }

    /// Refresh the cached affected elements of a job.
    pub fn update_affected_elements(&self) -> Result<()> {
        match self {
            Task::Completed(_) => Ok(()),
            Task::Job(t) => t.update_affected_elements(),
        }
    }

    /// Error a completed task was built from.
    pub fn wrapped_error(&self) -> Option<&Error> {
        match self {
            Task::Completed(t) => t.error(),
            Task::Job(_) => None,
        }
    }

    pub fn into_wrapped_error(self) -> Option<Error> {
        match self {
            Task::Completed(t) => t.into_error(),
            Task::Job(_) => None,
        }
    }

    /// Block until the task finishes or `timeout` elapses; `None` waits up
    /// to the configured job timeout. Returns whether the task finished.
    pub fn wait_for_completion(&self, timeout: Option<Duration>) -> Result<bool> {
        match self {
            Task::Completed(_) => Ok(true),
            Task::Job(t) => t.wait_for_completion(timeout),
        }
    }

    /// Poll until the task finishes, reporting progress to `callback`.
    pub fn wait<F>(&self, config: &JobWaitConfig, callback: F) -> Result<JobProgress>
    where
        F: FnMut(&JobProgress),
    {
        match self {
            Task::Completed(t) => {
                let mut callback = callback;
                let failed = t.status() != TaskStatus::CompletedSuccessfully;
                let progress = JobProgress {
                    state: if failed {
                        JobState::Exception
                    } else {
                        JobState::Completed
                    },
                    task_status: t.status(),
                    percent_complete: 100,
                    status: t.status().to_string(),
                    elapsed: Duration::ZERO,
                    error_code: failed.then(|| t.error_code()),
                    error_description: t.error_summary_description().map(str::to_string),
                };
                callback(&progress);
                Ok(progress)
            }
            Task::Job(t) => t.wait(config, callback),
        }
    }

    /// Request cancellation. Returns `false` when the task already finished.
    pub fn cancel(&self) -> Result<bool> {
        match self {
            Task::Completed(_) => Ok(false),
            Task::Job(t) => t.cancel(),
        }
    }

    /// Error code and text to report for a failed task.
    ///
    /// An empty summary is replaced by the details, and then by the
    /// client-side message; only in that last case is the text not
    /// considered server-provided.
    pub fn error_information(&self) -> ErrorInformation {
        let mut summary = non_empty(self.error_summary_description());
        let mut details = non_empty(self.error_details_description());
        if summary.is_none() {
            summary = details.take();
        }
        let mut server_provided = true;
        if summary.is_none() {
            summary = non_empty(self.client_side_failed_message());
            server_provided = false;
        }
        ErrorInformation {
            error_code: self.error_code(),
            summary,
            details,
            server_provided,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_display() {
        assert_eq!(TaskStatus::Running.to_string(), "Running");
        assert_eq!(
            TaskStatus::CompletedWithErrors.to_string(),
            "CompletedWithErrors"
        );
    }

    #[test]
    fn test_completed_task_accessors() {
        let task = Task::from(CompletedTask::success());
        assert!(task.is_completed());
        assert_eq!(task.percent_complete(), 100);
        assert!(!task.cancelable());
        assert!(!task.cancel().unwrap());
        assert!(task.wait_for_completion(Some(Duration::ZERO)).unwrap());
        assert!(task.name().is_empty());
    }

    #[test]
    fn test_error_information_prefers_server_text() {
        let task = Task::from(CompletedTask::from_code(32768));
        let info = task.error_information();
        assert_eq!(info.summary, None);
        assert!(!info.server_provided);

        let mut task = Task::from(CompletedTask::from_code(32768));
        task.set_client_side_failed_message("Could not rename the virtual machine.");
        let info = task.error_information();
        assert_eq!(
            info.summary.as_deref(),
            Some("Could not rename the virtual machine.")
        );
        assert!(!info.server_provided);
        assert_eq!(info.error_code, 32768);
    }

    #[test]
    fn test_error_information_promotes_details() {
        let task = Task::from(CompletedTask::from_error(Error::OperationFailed(
            crate::error::OperationFailedError {
                operation: Operation::Put,
                error_code: 32775,
                message: String::new(),
                details: Some("The VM is running.".to_string()),
                canceled: false,
                object_path: None,
                source: None,
            },
        )));
        let info = task.error_information();
        assert_eq!(info.summary.as_deref(), Some("The VM is running."));
        assert_eq!(info.details, None);
        assert!(info.server_provided);
    }

    #[test]
    fn test_wait_on_completed_task_reports_once() {
        let task = Task::from(CompletedTask::from_code(32773));
        let mut calls = 0;
        let progress = task
            .wait(&JobWaitConfig::default(), |_| calls += 1)
            .unwrap();
        assert_eq!(calls, 1);
        assert!(progress.is_failed());
        assert_eq!(progress.error_code, Some(32773));
    }
}
