use core::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::object::WmiObjectPath;
use crate::task::{JobState, Operation};

/// Classification of failure types for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Operation may succeed if retried.
    Transient,
    /// Retrying will not help.
    Permanent,
    /// Remote side is busy, retry after a delay.
    ResourceBusy,
    /// Caller lacks permission.
    AuthenticationFailed,
    /// Fix local configuration and retry.
    Configuration,
    /// Transport-level failure.
    Network,
    /// Unknown failure type.
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureType::Transient => "Transient",
            FailureType::Permanent => "Permanent",
            FailureType::ResourceBusy => "ResourceBusy",
            FailureType::AuthenticationFailed => "AuthenticationFailed",
            FailureType::Configuration => "Configuration",
            FailureType::Network => "Network",
            FailureType::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Why a call to the remote instance store failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    AccessDenied,
    RpcServerUnavailable,
    RpcCallFailed,
    NotSupported,
    Timeout,
    InvalidParameter,
    ProviderFailure,
    Unknown,
}

impl FailureReason {
    /// Retry classification for this reason.
    pub fn failure_type(&self) -> FailureType {
        match self {
            FailureReason::AccessDenied => FailureType::AuthenticationFailed,
            FailureReason::RpcServerUnavailable | FailureReason::RpcCallFailed => {
                FailureType::Network
            }
            FailureReason::Timeout => FailureType::Transient,
            FailureReason::NotSupported | FailureReason::InvalidParameter => {
                FailureType::Permanent
            }
            FailureReason::ProviderFailure | FailureReason::Unknown => FailureType::Unknown,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::AccessDenied => "access denied",
            FailureReason::RpcServerUnavailable => "RPC server unavailable",
            FailureReason::RpcCallFailed => "RPC call failed",
            FailureReason::NotSupported => "not supported",
            FailureReason::Timeout => "timed out",
            FailureReason::InvalidParameter => "invalid parameter",
            FailureReason::ProviderFailure => "provider failure",
            FailureReason::Unknown => "unknown failure",
        };
        f.write_str(s)
    }
}

/// Failure reported by an [`InstanceStore`](crate::store::InstanceStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("object not found: {path}")]
    NotFound { path: String },

    #[error("method '{method}' not found on class '{class_name}'")]
    MethodNotFound { class_name: String, method: String },

    #[error("{reason}: {message}")]
    CallFailed {
        reason: FailureReason,
        message: String,
    },
}

impl StoreError {
    pub fn not_found(path: &WmiObjectPath) -> Self {
        StoreError::NotFound {
            path: path.to_string(),
        }
    }

    pub fn call_failed(reason: FailureReason, message: impl Into<String>) -> Self {
        StoreError::CallFailed {
            reason,
            message: message.into(),
        }
    }
}

pub type StoreResult<T> = core::result::Result<T, StoreError>;

/// Which part of a class definition was missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassMember {
    Property,
    Method,
}

impl fmt::Display for ClassMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassMember::Property => f.write_str("property"),
            ClassMember::Method => f.write_str("method"),
        }
    }
}

/// A remote method or job that finished without success.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct OperationFailedError {
    /// Operation that failed.
    pub operation: Operation,
    /// Server or client error code.
    pub error_code: i64,
    /// Human summary produced by the entity's error-code mapper.
    pub message: String,
    /// Longer description, when the server supplied one.
    pub details: Option<String>,
    /// The job was canceled rather than failing.
    pub canceled: bool,
    /// Path of the object the operation targeted.
    pub object_path: Option<String>,
    #[source]
    pub source: Option<Box<Error>>,
}

impl OperationFailedError {
    pub fn failure_type(&self) -> FailureType {
        match self.error_code {
            32769 => FailureType::AuthenticationFailed,
            32772 => FailureType::Transient,
            32774 => FailureType::ResourceBusy,
            32777 => FailureType::Network,
            _ if self.canceled => FailureType::Transient,
            _ => FailureType::Permanent,
        }
    }
}

/// Programmatic error kind, independent of the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ObjectNotFound,
    RelatedObjectNotFound,
    InvalidKey,
    InvalidPath,
    InvalidPropertyValue,
    ClassDefinitionMismatch,
    RemoteCallFailed,
    OperationFailed,
    JobTimeout,
    TaskNotCompleted,
    DuplicateRegistration,
    Config,
}

/// Errors raised by the proxy cache and view layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Remote object absent at fetch time, or already observed deleted.
    #[error("object '{path}' was not found on the server")]
    ObjectNotFound { path: String },

    #[error("no {class_name} is related to '{path}' through {association}")]
    RelatedObjectNotFound {
        path: String,
        association: String,
        class_name: String,
    },

    #[error("cannot build a key for class '{class_name}': {message}")]
    InvalidKey { class_name: String, message: String },

    #[error("invalid object path '{path}': {message}")]
    InvalidPath { path: String, message: String },

    #[error("property '{property}' holds {value}, which is not a valid {expected}")]
    InvalidPropertyValue {
        property: String,
        expected: &'static str,
        value: String,
    },

    #[error("class '{class_name}' has no {member} named '{name}'")]
    ClassDefinitionMismatch {
        class_name: String,
        member: ClassMember,
        name: String,
    },

    #[error("call to server '{server}' failed ({reason}): {message}")]
    RemoteCallFailed {
        server: String,
        reason: FailureReason,
        message: String,
    },

    #[error(transparent)]
    OperationFailed(#[from] OperationFailedError),

    #[error("job '{job}' did not finish within {timeout:?} (last state {last_state})")]
    JobTimeout {
        job: String,
        timeout: Duration,
        last_state: JobState,
        percent_complete: Option<u16>,
    },

    #[error("task has not completed yet")]
    TaskNotCompleted,

    #[error("class '{0}' is registered more than once")]
    DuplicateRegistration(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn object_not_found(path: &WmiObjectPath) -> Self {
        Error::ObjectNotFound {
            path: path.to_string(),
        }
    }

    pub fn invalid_key(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidKey {
            class_name: class_name.into(),
            message: message.into(),
        }
    }

    pub fn invalid_path(path: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidPath {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Translate a store failure observed while working on `path`.
    pub fn from_store(err: StoreError, path: &WmiObjectPath) -> Self {
        match err {
            StoreError::NotFound { .. } => Error::object_not_found(path),
            other => Error::from_store_on(path.server(), other),
        }
    }

    /// Translate a store failure from a call not tied to one object.
    pub fn from_store_on(server: &str, err: StoreError) -> Self {
        match err {
            StoreError::NotFound { path } => Error::ObjectNotFound { path },
            StoreError::MethodNotFound { class_name, method } => Error::ClassDefinitionMismatch {
                class_name,
                member: ClassMember::Method,
                name: method,
            },
            StoreError::CallFailed { reason, message } => Error::RemoteCallFailed {
                server: server.to_string(),
                reason,
                message,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ObjectNotFound { .. } => ErrorKind::ObjectNotFound,
            Error::RelatedObjectNotFound { .. } => ErrorKind::RelatedObjectNotFound,
            Error::InvalidKey { .. } => ErrorKind::InvalidKey,
            Error::InvalidPath { .. } => ErrorKind::InvalidPath,
            Error::InvalidPropertyValue { .. } => ErrorKind::InvalidPropertyValue,
            Error::ClassDefinitionMismatch { .. } => ErrorKind::ClassDefinitionMismatch,
            Error::RemoteCallFailed { .. } => ErrorKind::RemoteCallFailed,
            Error::OperationFailed(_) => ErrorKind::OperationFailed,
            Error::JobTimeout { .. } => ErrorKind::JobTimeout,
            Error::TaskNotCompleted => ErrorKind::TaskNotCompleted,
            Error::DuplicateRegistration(_) => ErrorKind::DuplicateRegistration,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    /// Human-readable summary, suitable for showing to an operator.
    pub fn summary(&self) -> String {
        self.to_string()
    }

    pub fn failure_type(&self) -> FailureType {
        match self {
            Error::RemoteCallFailed { reason, .. } => reason.failure_type(),
            Error::OperationFailed(e) => e.failure_type(),
            Error::JobTimeout { .. } => FailureType::Transient,
            Error::DuplicateRegistration(_) | Error::Config(_) => FailureType::Configuration,
            Error::TaskNotCompleted => FailureType::Unknown,
            Error::ObjectNotFound { .. }
            | Error::RelatedObjectNotFound { .. }
            | Error::InvalidKey { .. }
            | Error::InvalidPath { .. }
            | Error::InvalidPropertyValue { .. }
            | Error::ClassDefinitionMismatch { .. } => FailureType::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self.failure_type(),
            FailureType::Transient | FailureType::ResourceBusy | FailureType::Network
        )
    }

    pub fn is_permanent(&self) -> bool {
        matches!(
            self.failure_type(),
            FailureType::Permanent | FailureType::Configuration
        )
    }

    /// Returns the remote failure reason when this is a transport failure.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Error::RemoteCallFailed { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn vm_path() -> WmiObjectPath {
        WmiObjectPath::new("HOST1", r"root\virtualization\v2", "Msvm_ComputerSystem")
            .with_key("Name", "A1B2")
    }

    #[test]
    fn test_from_store_not_found() {
        let err = Error::from_store(StoreError::not_found(&vm_path()), &vm_path());
        assert_eq!(err.kind(), ErrorKind::ObjectNotFound);
        assert!(err.is_permanent());
    }

    #[test]
    fn test_from_store_call_failed_keeps_reason() {
        let err = Error::from_store(
            StoreError::call_failed(FailureReason::RpcServerUnavailable, "no route"),
            &vm_path(),
        );
        assert_eq!(err.kind(), ErrorKind::RemoteCallFailed);
        assert_eq!(err.failure_reason(), Some(FailureReason::RpcServerUnavailable));
        assert!(err.is_transient());
        assert!(err.summary().contains("HOST1"));
    }

    #[test]
    fn test_from_store_method_not_found() {
        let err = Error::from_store(
            StoreError::MethodNotFound {
                class_name: "Msvm_ComputerSystem".to_string(),
                method: "Frobnicate".to_string(),
            },
            &vm_path(),
        );
        assert_eq!(err.kind(), ErrorKind::ClassDefinitionMismatch);
        assert_eq!(
            err.to_string(),
            "class 'Msvm_ComputerSystem' has no method named 'Frobnicate'"
        );
    }

    #[test]
    fn test_operation_failed_classification() {
        let failed = |code| OperationFailedError {
            operation: Operation::Put,
            error_code: code,
            message: "failed".to_string(),
            details: None,
            canceled: false,
            object_path: None,
            source: None,
        };
        assert_eq!(
            failed(32769).failure_type(),
            FailureType::AuthenticationFailed
        );
        assert_eq!(failed(32774).failure_type(), FailureType::ResourceBusy);
        assert_eq!(failed(32768).failure_type(), FailureType::Permanent);

        let err: Error = failed(32772).into();
        assert_eq!(err.kind(), ErrorKind::OperationFailed);
        assert!(err.is_transient());
    }

    #[test]
    fn test_failure_reason_display() {
        assert_eq!(FailureReason::AccessDenied.to_string(), "access denied");
        assert_eq!(FailureType::Network.to_string(), "Network");
    }
}
