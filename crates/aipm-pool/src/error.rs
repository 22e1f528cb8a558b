//! Error taxonomy for the session pool.
//!
//! Session and process failures never escape as panics or transport errors;
//! they surface to callers only as a failed [`TaskResult`](crate::TaskResult)
//! carrying one of these variants plus whatever output was captured.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::session::SessionId;

/// Reasons a task (or a session start) can fail.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PoolError {
    /// Malformed request, rejected before any session is involved.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The assistant process could not be launched or never became ready.
    #[error("session {session} failed to start: {message}")]
    ProcessStart { session: SessionId, message: String },

    /// The task's own deadline elapsed.
    #[error("task timed out after {}ms", .timeout.as_millis())]
    TaskTimeout { timeout: Duration },

    /// The abnormality detector judged the session stuck.
    #[error("session {session} judged unresponsive (abnormality score {score:.2})")]
    AbnormalSession { session: SessionId, score: f64 },

    /// The assistant process died while the task was running.
    #[error("assistant process of session {session} {status}")]
    ProcessExit { session: SessionId, status: String },

    /// The caller withdrew the task before it was dispatched.
    #[error("task cancelled before dispatch")]
    Cancelled,

    /// The pool stopped while the task was pending.
    #[error("session pool is shutting down")]
    Shutdown,
}

impl PoolError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Stable identifier used in wire responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::ProcessStart { .. } => "process_start_error",
            Self::TaskTimeout { .. } => "task_timeout",
            Self::AbnormalSession { .. } => "abnormal_session",
            Self::ProcessExit { .. } => "process_exit",
            Self::Cancelled => "cancelled",
            Self::Shutdown => "shutdown",
        }
    }
}

/// A resolved-as-failed task.
#[derive(Debug, Clone, Error, Serialize)]
#[error("task {task_id} failed: {error}")]
pub struct TaskFailure {
    pub task_id: Uuid,
    /// Session the task was bound to, if it was ever dispatched.
    pub session_id: Option<SessionId>,
    #[serde(serialize_with = "serialize_display")]
    pub error: PoolError,
    /// Output captured before the failure.
    pub output: String,
}

fn serialize_display<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
    T: std::fmt::Display,
{
    serializer.collect_str(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(PoolError::validation("x").kind(), "validation_error");
        assert_eq!(
            PoolError::TaskTimeout {
                timeout: Duration::from_secs(1)
            }
            .kind(),
            "task_timeout"
        );
        assert_eq!(PoolError::Cancelled.kind(), "cancelled");
        assert_eq!(PoolError::Shutdown.kind(), "shutdown");
    }

    #[test]
    fn test_error_messages() {
        let err = PoolError::TaskTimeout {
            timeout: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "task timed out after 1500ms");

        let err = PoolError::AbnormalSession {
            session: 1,
            score: 0.7,
        };
        assert_eq!(
            err.to_string(),
            "session 1 judged unresponsive (abnormality score 0.70)"
        );
    }
}
