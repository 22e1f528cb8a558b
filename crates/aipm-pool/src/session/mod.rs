//! Sessions: one pool slot wrapping one assistant process.
//!
//! A session has a stable [`SessionId`] for the lifetime of the pool. Each
//! restart launches a new process generation under the same id. The process
//! itself is reached only through a [`ProcessLauncher`], so tests can script
//! an assistant without spawning anything.

mod output;
mod process;
pub(crate) mod worker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub use output::{AnsiStripper, strip_ansi};
pub use process::{
    CommandLauncher, ExitInfo, LaunchedProcess, ProcessEvent, ProcessLauncher, ProcessSignal,
};

/// Stable session identity (index into the pool).
pub type SessionId = usize;

// ============================================================================
// Configuration
// ============================================================================

/// How each session launches and talks to its assistant process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Program to run.
    pub command: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Working directory of the process.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
    /// Appended to every prompt and auto reply.
    pub line_ending: String,
    /// Output text that signals the process is ready for its first prompt.
    pub ready_pattern: Option<String>,
    /// Quiet wait after launch when no ready pattern is configured.
    pub startup_settle_ms: u64,
    /// Maximum wait for `ready_pattern`.
    pub startup_timeout_ms: u64,
    /// Remove terminal escape sequences from captured output.
    pub strip_ansi: bool,
    /// Canned answers to interactive permission prompts.
    pub auto_replies: Vec<AutoReply>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command: "kiro-cli".to_string(),
            args: vec!["chat".to_string(), "--trust-all-tools".to_string()],
            cwd: None,
            env: HashMap::new(),
            line_ending: "\n".to_string(),
            ready_pattern: None,
            startup_settle_ms: 3_000,
            startup_timeout_ms: 60_000,
            strip_ansi: true,
            auto_replies: vec![AutoReply {
                pattern: "[y/n/t]".to_string(),
                reply: "t".to_string(),
            }],
        }
    }
}

impl SessionConfig {
    pub fn startup_settle(&self) -> Duration {
        Duration::from_millis(self.startup_settle_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

/// Reply written to the process whenever its output contains `pattern`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoReply {
    pub pattern: String,
    pub reply: String,
}

// ============================================================================
// Session State
// ============================================================================

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Process is up and waiting for a task.
    Idle,
    /// A task is bound to the session.
    Busy,
    /// Process is being (re)started; the session takes no work.
    Restarting,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
            Self::Restarting => write!(f, "restarting"),
        }
    }
}

// ============================================================================
// Activity
// ============================================================================

/// Timestamps a session worker publishes for the monitor and status reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActivityTimes {
    /// Most recent output from the process.
    pub last_activity_at: Option<Instant>,
    /// Start of the task currently bound, if any.
    pub task_started_at: Option<Instant>,
}

/// Shared, worker-written view of a session's activity.
///
/// Written only by the session's own worker; everyone else reads snapshots.
#[derive(Debug, Default)]
pub struct SessionActivity {
    times: Mutex<ActivityTimes>,
}

impl SessionActivity {
    pub fn snapshot(&self) -> ActivityTimes {
        *self.lock()
    }

    pub(crate) fn touch(&self, now: Instant) {
        self.lock().last_activity_at = Some(now);
    }

    pub(crate) fn begin_task(&self, now: Instant) {
        let mut times = self.lock();
        times.task_started_at = Some(now);
        times.last_activity_at = Some(now);
    }

    pub(crate) fn end_task(&self) {
        self.lock().task_started_at = None;
    }

    fn lock(&self) -> MutexGuard<'_, ActivityTimes> {
        self.times.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Idle.to_string(), "idle");
        assert_eq!(SessionState::Busy.to_string(), "busy");
        assert_eq!(SessionState::Restarting.to_string(), "restarting");
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&SessionState::Restarting).unwrap();
        assert_eq!(json, "\"restarting\"");
    }

    #[tokio::test]
    async fn test_activity_task_lifecycle() {
        let activity = SessionActivity::default();
        assert!(activity.snapshot().task_started_at.is_none());

        let start = Instant::now();
        activity.begin_task(start);
        let snap = activity.snapshot();
        assert_eq!(snap.task_started_at, Some(start));
        assert_eq!(snap.last_activity_at, Some(start));

        activity.end_task();
        let snap = activity.snapshot();
        assert!(snap.task_started_at.is_none());
        assert_eq!(snap.last_activity_at, Some(start));
    }
}
