//! Server-side jobs with polling, timeout and progress callbacks.
//!
//! Methods that cannot finish synchronously return 4096 and a reference to a
//! `CIM_ConcreteJob`. [`JobTask`] follows that job through its proxy until it
//! reaches a final state.

use core::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::mapper::{Failure, GenericErrorCodeMapper, Operation, ERROR_JOB_DELETED, ERROR_SERVER_DISCONNECTED};
use super::TaskStatus;
use crate::association::Association;
use crate::error::{Error, ErrorKind, FailureType, Result};
use crate::object::{FromCimValue, ObjectKey, PropertyMap};
use crate::proxy::Proxy;
use crate::store::{RETURN_JOB_STARTED, RETURN_SUCCESS};

/// Default polling interval for job status.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default job timeout.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300); // 5 minutes

/// `CIM_ConcreteJob.JobState` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum JobState {
    New = 2,
    Starting = 3,
    Running = 4,
    Suspended = 5,
    ShuttingDown = 6,
    Completed = 7,
    Terminated = 8,
    Killed = 9,
    Exception = 10,
    Service = 11,
    CompletedWithWarnings = 32768,
    Unknown = 0,
}

impl From<u16> for JobState {
    fn from(value: u16) -> Self {
        match value {
            2 => JobState::New,
            3 => JobState::Starting,
            4 => JobState::Running,
            5 => JobState::Suspended,
            6 => JobState::ShuttingDown,
            7 => JobState::Completed,
            8 => JobState::Terminated,
            9 => JobState::Killed,
            10 => JobState::Exception,
            11 => JobState::Service,
            32768 => JobState::CompletedWithWarnings,
            _ => JobState::Unknown,
        }
    }
}

impl JobState {
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            JobState::New
                | JobState::Starting
                | JobState::Running
                | JobState::Suspended
                | JobState::ShuttingDown
        )
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, JobState::Completed | JobState::CompletedWithWarnings)
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            JobState::Terminated | JobState::Killed | JobState::Exception
        )
    }

    /// Task status for this state. States outside the known terminal set
    /// count as still running.
    pub fn status(&self) -> TaskStatus {
        match self {
            JobState::Completed | JobState::CompletedWithWarnings => {
                TaskStatus::CompletedSuccessfully
            }
            JobState::Terminated | JobState::Killed => TaskStatus::Canceled,
            JobState::Exception => TaskStatus::CompletedWithErrors,
            _ => TaskStatus::Running,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::New => "New",
            JobState::Starting => "Starting",
            JobState::Running => "Running",
            JobState::Suspended => "Suspended",
            JobState::ShuttingDown => "ShuttingDown",
            JobState::Completed => "Completed",
            JobState::Terminated => "Terminated",
            JobState::Killed => "Killed",
            JobState::Exception => "Exception",
            JobState::Service => "Service",
            JobState::CompletedWithWarnings => "CompletedWithWarnings",
            JobState::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Job progress information.
#[derive(Debug, Clone)]
pub struct JobProgress {
    /// Current job state.
    pub state: JobState,
    /// Task status derived from the state and client-side failures.
    pub task_status: TaskStatus,
    /// Percent complete (0-100).
    pub percent_complete: u16,
    /// Job status description.
    pub status: String,
    /// Elapsed time since waiting started.
    pub elapsed: Duration,
    /// Error code if job failed.
    pub error_code: Option<i64>,
    /// Error description if job failed.
    pub error_description: Option<String>,
}

impl JobProgress {
    /// Check if the job is still running.
    pub fn is_running(&self) -> bool {
        self.task_status == TaskStatus::Running
    }

    /// Check if the job completed successfully.
    pub fn is_completed(&self) -> bool {
        self.task_status == TaskStatus::CompletedSuccessfully
    }

    /// Check if the job failed or was canceled.
    pub fn is_failed(&self) -> bool {
        matches!(
            self.task_status,
            TaskStatus::CompletedWithErrors | TaskStatus::Canceled
        )
    }
}

/// Configuration for job waiting.
#[derive(Debug, Clone)]
pub struct JobWaitConfig {
    /// Maximum time to wait for job completion.
    pub timeout: Duration,
    /// Polling interval for job status.
    pub poll_interval: Duration,
}

impl Default for JobWaitConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_JOB_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl JobWaitConfig {
    /// Create a new configuration with specified timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    /// Set the polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Values read from the job instance on the last refresh.
#[derive(Debug, Clone)]
struct JobSnapshot {
    state: JobState,
    percent_complete: u16,
    error_code: i64,
    summary: Option<String>,
    details: Option<String>,
    job_status: Option<String>,
    name: String,
    instance_id: String,
    cancelable: bool,
    elapsed: Duration,
}

fn read<T: FromCimValue>(props: &PropertyMap, name: &str) -> Option<T> {
    props.get(name).and_then(|v| v.get::<T>())
}

impl JobSnapshot {
    fn from_properties(props: &PropertyMap) -> Self {
        Self {
            state: JobState::from(read::<u16>(props, "JobState").unwrap_or(0)),
            percent_complete: read(props, "PercentComplete").unwrap_or(0),
            error_code: read(props, "ErrorCode").unwrap_or(0),
            summary: read(props, "ErrorSummaryDescription"),
            details: read(props, "ErrorDescription"),
            job_status: read(props, "JobStatus"),
            name: read(props, "ElementName").unwrap_or_default(),
            instance_id: read(props, "InstanceID").unwrap_or_default(),
            cancelable: read(props, "Cancellable").unwrap_or(false),
            elapsed: read(props, "ElapsedTime").unwrap_or_default(),
        }
    }

    fn empty() -> Self {
        Self::from_properties(&PropertyMap::new())
    }
}

struct JobInner {
    snapshot: JobSnapshot,
    /// Set once the job reaches a final state; later refreshes are skipped.
    finished: bool,
    client_error: Option<i64>,
    client_side_failed_message: Option<String>,
    put_properties: Option<PropertyMap>,
}

/// A task backed by a server-side job.
pub struct JobTask {
    proxy: Arc<Proxy>,
    affected: Association,
    wait_config: JobWaitConfig,
    inner: Mutex<JobInner>,
}

impl JobTask {
    /// Wrap the job behind `proxy`, reading its current state.
    ///
    /// A job already gone on the server yields a task that is complete with
    /// errors.
    pub fn new(proxy: Arc<Proxy>, wait_config: JobWaitConfig, affected: Association) -> Result<Self> {
        let snapshot = match proxy.properties() {
            Ok(props) => JobSnapshot::from_properties(&props),
            Err(e) if e.kind() == ErrorKind::ObjectNotFound => JobSnapshot::empty(),
            Err(e) => return Err(e),
        };
        let finished = snapshot.state.status() != TaskStatus::Running;
        tracing::debug!(
            job = %proxy.key(),
            state = %snapshot.state,
            name = %snapshot.name,
            "tracking job"
        );
        Ok(Self {
            proxy,
            affected,
            wait_config,
            inner: Mutex::new(JobInner {
                snapshot,
                finished,
                client_error: None,
                client_side_failed_message: None,
                put_properties: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, JobInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &ObjectKey {
        self.proxy.key()
    }

    pub fn is_deleted(&self) -> bool {
        self.proxy.is_deleted()
    }

    fn has_client_failure(&self, inner: &JobInner) -> bool {
        inner.client_error.is_some() || self.is_deleted()
    }

    /// Re-read the job instance unless it already finished.
    pub fn refresh(&self) -> Result<()> {
        if self.lock().finished || self.is_deleted() {
            return Ok(());
        }
        let props = match self
            .proxy
            .update_property_cache(Duration::ZERO)
            .and_then(|()| self.proxy.properties())
        {
            Ok(props) => props,
            Err(e) if e.kind() == ErrorKind::ObjectNotFound => {
                tracing::info!(job = %self.proxy.key(), "job deleted before completing");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let snapshot = JobSnapshot::from_properties(&props);
        let finished = snapshot.state.status() != TaskStatus::Running;

        let mut inner = self.lock();
        if inner.finished {
            return Ok(());
        }
        tracing::debug!(
            job = %self.proxy.key(),
            name = %snapshot.name,
            state = %snapshot.state,
            percent = snapshot.percent_complete,
            error_code = snapshot.error_code,
            "updated job"
        );
        inner.snapshot = snapshot;
        inner.finished = finished;
        Ok(())
    }

    pub fn status(&self) -> TaskStatus {
        let inner = self.lock();
        match inner.snapshot.state.status() {
            TaskStatus::Running if self.has_client_failure(&inner) => TaskStatus::CompletedWithErrors,
            status => status,
        }
    }

    pub fn is_completed(&self) -> bool {
        let inner = self.lock();
        inner.finished || self.has_client_failure(&inner)
    }

    pub fn percent_complete(&self) -> u16 {
        let inner = self.lock();
        if inner.finished || self.has_client_failure(&inner) {
            100
        } else {
            inner.snapshot.percent_complete
        }
    }

    /// Server error code, replaced by a client-side code when the job was
    /// lost without the server reporting a failure.
    pub fn error_code(&self) -> i64 {
        let inner = self.lock();
        let server = inner.snapshot.error_code;
        let lost = server == 0 || server == i64::from(RETURN_JOB_STARTED);
        if self.is_deleted() && lost {
            ERROR_JOB_DELETED
        } else {
            match inner.client_error {
                Some(code) if lost => code,
                _ => server,
            }
        }
    }

    pub fn elapsed_time(&self) -> Duration {
        self.lock().snapshot.elapsed
    }

    pub fn error_summary_description(&self) -> Option<String> {
        self.lock().snapshot.summary.clone()
    }

    pub fn error_details_description(&self) -> Option<String> {
        self.lock().snapshot.details.clone()
    }

    pub fn name(&self) -> String {
        self.lock().snapshot.name.clone()
    }

    pub fn instance_id(&self) -> String {
        self.lock().snapshot.instance_id.clone()
    }

    pub fn cancelable(&self) -> bool {
        self.lock().snapshot.cancelable
    }

    pub fn completed_with_warnings(&self) -> bool {
        self.lock().snapshot.state == JobState::CompletedWithWarnings
    }

    pub fn client_side_failed_message(&self) -> Option<String> {
        self.lock().client_side_failed_message.clone()
    }

    pub fn set_client_side_failed_message(&self, message: impl Into<String>) {
        self.lock().client_side_failed_message = Some(message.into());
    }

    pub fn put_properties(&self) -> Option<PropertyMap> {
        self.lock().put_properties.clone()
    }

    pub fn set_put_properties(&self, properties: PropertyMap) {
        self.lock().put_properties = Some(properties);
    }

    /// Complete the task with a client-side error after the connection to
    /// the server was lost.
    pub fn inform_server_disconnected(&self, message: &str) {
        let mut inner = self.lock();
        if inner.finished || inner.client_error.is_some() {
            return;
        }
        tracing::warn!(job = %self.proxy.key(), "{message}");
        inner.client_error = Some(ERROR_SERVER_DISCONNECTED);
        inner.client_side_failed_message = Some(message.to_string());
    }

    /// Current progress without waiting.
    pub fn progress(&self, elapsed: Duration) -> JobProgress {
        let task_status = self.status();
        let percent_complete = self.percent_complete();
        let error_code = self.error_code();
        let inner = self.lock();
        let failed = matches!(
            task_status,
            TaskStatus::CompletedWithErrors | TaskStatus::Canceled
        );
        let (error_code, error_description) = if failed {
            let description = inner
                .snapshot
                .details
                .clone()
                .or_else(|| inner.snapshot.summary.clone())
                .or_else(|| inner.client_side_failed_message.clone());
            (Some(error_code), description)
        } else {
            (None, None)
        };
        JobProgress {
            state: inner.snapshot.state,
            task_status,
            percent_complete,
            status: inner
                .snapshot
                .job_status
                .clone()
                .unwrap_or_else(|| inner.snapshot.state.to_string()),
            elapsed,
            error_code,
            error_description,
        }
    }

    /// Wait for the job to reach a final state, polling at
    /// `config.poll_interval`.
    ///
    /// Returns the final progress whether the job succeeded or not.
    /// Losing the connection completes the task with a client-side error.
    pub fn wait<F>(&self, config: &JobWaitConfig, mut callback: F) -> Result<JobProgress>
    where
        F: FnMut(&JobProgress),
    {
        let start = Instant::now();
        let mut last_progress: Option<JobProgress> = None;

        loop {
            let elapsed = start.elapsed();

            // Check timeout
            if elapsed > config.timeout {
                let last_state = last_progress
                    .as_ref()
                    .map(|p| p.state)
                    .unwrap_or(JobState::Unknown);
                let percent = last_progress.as_ref().map(|p| p.percent_complete);
                tracing::warn!(job = %self.proxy.key(), timeout = ?config.timeout, "timed out waiting for job");
                return Err(Error::JobTimeout {
                    job: self.proxy.key().to_string(),
                    timeout: config.timeout,
                    last_state,
                    percent_complete: percent,
                });
            }

            if let Err(e) = self.refresh() {
                if e.failure_type() != FailureType::Network {
                    return Err(e);
                }
                self.inform_server_disconnected(&e.to_string());
            }

            let progress = self.progress(elapsed);
            callback(&progress);

            if !progress.is_running() {
                return Ok(progress);
            }
            last_progress = Some(progress);

            std::thread::sleep(config.poll_interval);
        }
    }

    /// Block until the job finishes or `timeout` (default: the configured
    /// job timeout) elapses. Returns whether the job finished.
    pub fn wait_for_completion(&self, timeout: Option<Duration>) -> Result<bool> {
        if self.is_completed() {
            return Ok(true);
        }
        let mut config = self.wait_config.clone();
        if let Some(timeout) = timeout {
            config.timeout = timeout;
        }
        match self.wait(&config, |_| {}) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::JobTimeout => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Ask the server to stop the job. Returns `false` when the job had
    /// already finished.
    pub fn cancel(&self) -> Result<bool> {
        if self.is_completed() {
            return Ok(false);
        }
        tracing::info!(job = %self.proxy.key(), "canceling job");
        let args = PropertyMap::new().with("RequestedState", 4u16);
        let result = self.proxy.invoke_method("RequestStateChange", &args)?;
        match result.return_value {
            RETURN_SUCCESS => {
                self.refresh()?;
            }
            RETURN_JOB_STARTED => {
                self.wait_for_completion(None)?;
                if self.status() != TaskStatus::Canceled {
                    return Err(self.cancel_failed(self.error_code()));
                }
            }
            code => return Err(self.cancel_failed(i64::from(code))),
        }
        tracing::info!(job = %self.proxy.key(), "job canceled");
        Ok(true)
    }

    fn cancel_failed(&self, error_code: i64) -> Error {
        Failure {
            operation: Operation::CancelTask,
            error_code,
            summary: None,
            details: None,
            canceled: false,
        }
        .into_error(
            &GenericErrorCodeMapper,
            Some(self.proxy.key().to_string()),
            None,
        )
    }

    /// Objects the job reports as affected, from the association cache.
    pub fn affected_elements(&self) -> Result<Vec<ObjectKey>> {
        if self.is_deleted() {
            return Ok(Vec::new());
        }
        self.proxy.get_related_object_keys(&self.affected, Duration::MAX)
    }

    /// Re-enumerate the affected elements.
    pub fn update_affected_elements(&self) -> Result<()> {
        if self.is_deleted() {
            return Ok(());
        }
        self.proxy.update_one_cached_association(&self.affected, Duration::ZERO)
    }
}

impl fmt::Debug for JobTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("JobTask")
            .field("job", self.proxy.key())
            .field("state", &inner.snapshot.state)
            .field("finished", &inner.finished)
            .field("client_error", &inner.client_error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_from_u16() {
        assert_eq!(JobState::from(2), JobState::New);
        assert_eq!(JobState::from(3), JobState::Starting);
        assert_eq!(JobState::from(4), JobState::Running);
        assert_eq!(JobState::from(5), JobState::Suspended);
        assert_eq!(JobState::from(6), JobState::ShuttingDown);
        assert_eq!(JobState::from(7), JobState::Completed);
        assert_eq!(JobState::from(8), JobState::Terminated);
        assert_eq!(JobState::from(9), JobState::Killed);
        assert_eq!(JobState::from(10), JobState::Exception);
        assert_eq!(JobState::from(11), JobState::Service);
        assert_eq!(JobState::from(32768), JobState::CompletedWithWarnings);
        assert_eq!(JobState::from(0), JobState::Unknown);
        assert_eq!(JobState::from(99), JobState::Unknown);
        assert_eq!(JobState::from(1), JobState::Unknown);
    }

    #[test]
    fn test_job_state_predicates() {
        assert!(JobState::New.is_running());
        assert!(JobState::ShuttingDown.is_running());
        assert!(!JobState::Completed.is_running());
        assert!(!JobState::Unknown.is_running());

        assert!(JobState::Completed.is_completed());
        assert!(JobState::CompletedWithWarnings.is_completed());
        assert!(!JobState::Exception.is_completed());

        assert!(JobState::Terminated.is_failed());
        assert!(JobState::Killed.is_failed());
        assert!(JobState::Exception.is_failed());
        assert!(!JobState::CompletedWithWarnings.is_failed());
    }

    #[test]
    fn test_job_state_task_status() {
        for state in [2u16, 3, 4, 5, 6] {
            assert_eq!(JobState::from(state).status(), TaskStatus::Running);
        }
        assert_eq!(JobState::Completed.status(), TaskStatus::CompletedSuccessfully);
        assert_eq!(
            JobState::CompletedWithWarnings.status(),
            TaskStatus::CompletedSuccessfully
        );
        assert_eq!(JobState::Terminated.status(), TaskStatus::Canceled);
        assert_eq!(JobState::Killed.status(), TaskStatus::Canceled);
        assert_eq!(JobState::Exception.status(), TaskStatus::CompletedWithErrors);
    }

    #[test]
    fn test_job_state_display() {
        assert_eq!(format!("{}", JobState::New), "New");
        assert_eq!(format!("{}", JobState::Running), "Running");
        assert_eq!(format!("{}", JobState::CompletedWithWarnings), "CompletedWithWarnings");
        assert_eq!(format!("{}", JobState::Unknown), "Unknown");
    }

    #[test]
    fn test_job_wait_config() {
        let config = JobWaitConfig::default();
        assert_eq!(config.timeout, DEFAULT_JOB_TIMEOUT);
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);

        let custom = JobWaitConfig::with_timeout(Duration::from_secs(60))
            .with_poll_interval(Duration::from_millis(50));
        assert_eq!(custom.timeout, Duration::from_secs(60));
        assert_eq!(custom.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_job_progress_predicates() {
        let progress = |task_status| JobProgress {
            state: JobState::Running,
            task_status,
            percent_complete: 50,
            status: "In progress".to_string(),
            elapsed: Duration::from_secs(10),
            error_code: None,
            error_description: None,
        };
        assert!(progress(TaskStatus::Running).is_running());
        assert!(progress(TaskStatus::CompletedSuccessfully).is_completed());
        assert!(progress(TaskStatus::Canceled).is_failed());
        assert!(progress(TaskStatus::CompletedWithErrors).is_failed());
        assert!(!progress(TaskStatus::CompletedWithErrors).is_completed());
    }

    #[test]
    fn test_snapshot_tolerates_missing_properties() {
        let snapshot = JobSnapshot::from_properties(
            &PropertyMap::new()
                .with("JobState", 7u16)
                .with("ElementName", "Export"),
        );
        assert_eq!(snapshot.state, JobState::Completed);
        assert_eq!(snapshot.name, "Export");
        assert_eq!(snapshot.error_code, 0);
        assert_eq!(snapshot.summary, None);
        assert!(!snapshot.cancelable);
    }
}
