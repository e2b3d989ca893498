//! Error types for the scheduler core.
//!
//! Two layers: [`TaskFailure`] describes how a single task attempt ended
//! (kind + message, recorded on the task and its context), while
//! [`SchedulerError`] is what public manager/sequencer operations return --
//! either a structural rejection or a wrapped task failure.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a task failure.
///
/// Absence of an error is represented as `Option::<TaskErrorKind>::None` on
/// task state, not as a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// Parameter schema validation failed. Terminal; never retried.
    InvalidParameter,
    /// Cooperative cancellation or manager-wide cancel. Terminal; never
    /// retried.
    Cancelled,
    /// An attempt exceeded its time budget. Retried while budget remains.
    Timeout,
    /// The routine reported an error. Retried while budget remains.
    ExecutionFailed,
    /// A dependency ended in a non-completed state. Terminal.
    DependencyFailed,
    /// A device-level failure surfaced by a routine. Retried while budget
    /// remains.
    DeviceError,
}

impl TaskErrorKind {
    /// Whether a failure of this kind is eligible for another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ExecutionFailed | Self::DeviceError
        )
    }
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidParameter => "invalid_parameter",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::ExecutionFailed => "execution_failed",
            Self::DependencyFailed => "dependency_failed",
            Self::DeviceError => "device_error",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskErrorKind {
    type Err = TaskErrorKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invalid_parameter" => Ok(Self::InvalidParameter),
            "cancelled" => Ok(Self::Cancelled),
            "timeout" => Ok(Self::Timeout),
            "execution_failed" => Ok(Self::ExecutionFailed),
            "dependency_failed" => Ok(Self::DependencyFailed),
            "device_error" => Ok(Self::DeviceError),
            other => Err(TaskErrorKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskErrorKind`] string.
#[derive(Debug, Clone)]
pub struct TaskErrorKindParseError(pub String);

impl fmt::Display for TaskErrorKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task error kind: {:?}", self.0)
    }
}

impl std::error::Error for TaskErrorKindParseError {}

/// How a task attempt (or the whole task) failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct TaskFailure {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Cancelled, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Timeout, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::ExecutionFailed, message)
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::InvalidParameter, message)
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::DependencyFailed, message)
    }

    pub fn device(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::DeviceError, message)
    }
}

/// Errors surfaced by public manager and sequencer operations.
///
/// Structural variants are rejected before any execution happens and never
/// become task status.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown task id {0:?}")]
    UnknownId(String),

    #[error("unknown task type {0:?}")]
    UnknownType(String),

    #[error("unknown target {0:?}")]
    UnknownTarget(String),

    #[error("dependency cycle detected involving {0}")]
    CycleDetected(String),

    #[error(transparent)]
    Task(#[from] TaskFailure),
}

impl SchedulerError {
    /// The failure kind when this error wraps a task failure.
    pub fn task_kind(&self) -> Option<TaskErrorKind> {
        match self {
            Self::Task(f) => Some(f.kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(TaskErrorKind::Timeout.is_retryable());
        assert!(TaskErrorKind::ExecutionFailed.is_retryable());
        assert!(TaskErrorKind::DeviceError.is_retryable());
        assert!(!TaskErrorKind::InvalidParameter.is_retryable());
        assert!(!TaskErrorKind::Cancelled.is_retryable());
        assert!(!TaskErrorKind::DependencyFailed.is_retryable());
    }

    #[test]
    fn kind_display_roundtrip() {
        for kind in [
            TaskErrorKind::InvalidParameter,
            TaskErrorKind::Cancelled,
            TaskErrorKind::Timeout,
            TaskErrorKind::ExecutionFailed,
            TaskErrorKind::DependencyFailed,
            TaskErrorKind::DeviceError,
        ] {
            let parsed: TaskErrorKind = kind.to_string().parse().expect("should parse");
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn rejects_unknown_kind() {
        let err = "exploded".parse::<TaskErrorKind>().unwrap_err();
        assert!(err.to_string().contains("exploded"));
    }

    #[test]
    fn task_failure_message() {
        let f = TaskFailure::timeout("attempt exceeded 50ms");
        assert_eq!(f.to_string(), "timeout: attempt exceeded 50ms");
    }
}
