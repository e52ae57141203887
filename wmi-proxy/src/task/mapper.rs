//! Error-code to message mapping for failed operations.

use core::fmt;

use crate::error::{Error, OperationFailedError};

/// Client-side code: the connection to the server was lost while waiting.
pub const ERROR_SERVER_DISCONNECTED: i64 = -1;

/// Client-side code: the call succeeded but produced no usable result.
pub const ERROR_RESULT_NOT_FOUND: i64 = -2;

/// Client-side code: the job object vanished before reaching a final state.
pub const ERROR_JOB_DELETED: i64 = -3;

/// Kind of remote operation, carried by `OperationFailed` errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Put,
    Delete,
    ChangeState,
    Shutdown,
    CancelTask,
    /// Any other extrinsic method, by name.
    Method(&'static str),
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Put => f.write_str("Put"),
            Operation::Delete => f.write_str("Delete"),
            Operation::ChangeState => f.write_str("ChangeState"),
            Operation::Shutdown => f.write_str("Shutdown"),
            Operation::CancelTask => f.write_str("CancelTask"),
            Operation::Method(name) => f.write_str(name),
        }
    }
}

/// Well-known text for CIM method return codes and client-side codes.
pub fn return_code_text(error_code: i64) -> Option<&'static str> {
    let text = match error_code {
        ERROR_SERVER_DISCONNECTED => "the connection to the server was lost",
        ERROR_RESULT_NOT_FOUND => "the operation did not produce the expected object",
        ERROR_JOB_DELETED => "the job was deleted before it completed",
        32768 => "failed",
        32769 => "access denied",
        32770 => "not supported",
        32771 => "status is unknown",
        32772 => "timeout",
        32773 => "invalid parameter",
        32774 => "system is in use",
        32775 => "invalid state for this operation",
        32776 => "incorrect data type",
        32777 => "system is not available",
        32778 => "out of memory",
        32779 => "file not found",
        _ => return None,
    };
    Some(text)
}

fn fallback_message(operation: Operation, error_code: i64) -> String {
    match return_code_text(error_code) {
        Some(text) => format!("{operation} failed: {text} ({error_code})"),
        None => format!("{operation} failed with error code {error_code}"),
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// Turns an operation, error code and server text into a human message.
///
/// Entity families plug in their own mapper to word specific failures and
/// defer to [`GenericErrorCodeMapper`] for everything else.
pub trait ErrorCodeMapper: Send + Sync {
    fn map_error(
        &self,
        operation: Operation,
        error_code: i64,
        summary: Option<&str>,
        details: Option<&str>,
    ) -> String;
}

/// Joins summary and detail; falls back to the return-code text.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericErrorCodeMapper;

impl ErrorCodeMapper for GenericErrorCodeMapper {
    fn map_error(
        &self,
        operation: Operation,
        error_code: i64,
        summary: Option<&str>,
        details: Option<&str>,
    ) -> String {
        match (non_empty(summary), non_empty(details)) {
            (Some(s), Some(d)) => format!("{s} {d}"),
            (Some(text), None) | (None, Some(text)) => text.to_string(),
            (None, None) => fallback_message(operation, error_code),
        }
    }
}

/// Uses the server's own summary text as the message.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerProvidedMessageMapper;

impl ErrorCodeMapper for ServerProvidedMessageMapper {
    fn map_error(
        &self,
        operation: Operation,
        error_code: i64,
        summary: Option<&str>,
        details: Option<&str>,
    ) -> String {
        non_empty(summary)
            .or(non_empty(details))
            .map(str::to_string)
            .unwrap_or_else(|| fallback_message(operation, error_code))
    }
}

/// Mapper for guest shutdown requests sent through the shutdown component.
#[derive(Debug, Clone, Default)]
pub struct ShutdownErrorCodeMapper {
    vm_name: String,
}

impl ShutdownErrorCodeMapper {
    pub fn new(vm_name: impl Into<String>) -> Self {
        Self {
            vm_name: vm_name.into(),
        }
    }
}

impl ErrorCodeMapper for ShutdownErrorCodeMapper {
    fn map_error(
        &self,
        operation: Operation,
        error_code: i64,
        summary: Option<&str>,
        details: Option<&str>,
    ) -> String {
        match (operation, error_code) {
            (Operation::Shutdown, 32775) => format!(
                "Cannot shut down '{}': the guest operating system is not ready to accept a shutdown request.",
                self.vm_name
            ),
            (Operation::Shutdown, 32777) => format!(
                "Cannot shut down '{}': the shutdown integration service is not running in the guest.",
                self.vm_name
            ),
            _ => GenericErrorCodeMapper.map_error(operation, error_code, summary, details),
        }
    }
}

/// Inputs for an `OperationFailed` error before mapping.
pub(crate) struct Failure<'a> {
    pub operation: Operation,
    pub error_code: i64,
    pub summary: Option<&'a str>,
    pub details: Option<&'a str>,
    pub canceled: bool,
}

impl Failure<'_> {
    /// Map the failure to an error and log it; cancellations log at warn.
    pub(crate) fn into_error(
        self,
        mapper: &dyn ErrorCodeMapper,
        object_path: Option<String>,
        source: Option<Error>,
    ) -> Error {
        let message = mapper.map_error(self.operation, self.error_code, self.summary, self.details);
        if self.canceled {
            tracing::warn!(
                operation = %self.operation,
                error_code = self.error_code,
                path = object_path.as_deref().unwrap_or(""),
                "{message}"
            );
        } else {
            tracing::error!(
                operation = %self.operation,
                error_code = self.error_code,
                path = object_path.as_deref().unwrap_or(""),
                "{message}"
            );
        }
        Error::OperationFailed(OperationFailedError {
            operation: self.operation,
            error_code: self.error_code,
            message,
            details: non_empty(self.details).map(str::to_string),
            canceled: self.canceled,
            object_path,
            source: source.map(Box::new),
        })
    }
}
