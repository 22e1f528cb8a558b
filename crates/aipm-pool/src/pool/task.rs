//! Tasks and the handles callers wait on.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use super::PoolShared;
use crate::completion::CompletionKind;
use crate::error::{PoolError, TaskFailure};
use crate::session::SessionId;

/// Task identifier.
pub type TaskId = Uuid;

/// Outcome of a task: exactly one per submitted task.
pub type TaskResult = Result<TaskOutput, TaskFailure>;

/// A prompt to run on some session.
#[derive(Debug, Clone, Default)]
pub struct TaskRequest {
    pub prompt: String,
    /// Sent ahead of the prompt, separated by a blank line.
    pub context: Option<String>,
    /// Overrides the pool's default timeout. Counts from submission.
    pub timeout: Option<Duration>,
}

impl TaskRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.prompt.trim().is_empty() {
            return Err(PoolError::validation("prompt is required"));
        }
        Ok(())
    }

    /// Text written to the assistant.
    pub fn render(&self) -> String {
        match self.context.as_deref().filter(|c| !c.trim().is_empty()) {
            Some(context) => format!("{}\n\n{}", context, self.prompt),
            None => self.prompt.clone(),
        }
    }
}

/// A successfully completed task.
#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub output: String,
    pub completion: CompletionKind,
    /// Set when completion was inferred from silence alone.
    pub possibly_incomplete: bool,
    /// Time spent executing on the session.
    pub elapsed: Duration,
    /// Time spent waiting in the queue.
    pub queued_for: Duration,
}

// ============================================================================
// Internal task
// ============================================================================

/// An accepted task. Owned by the queue, then by exactly one session.
#[derive(Debug)]
pub(crate) struct Task {
    pub(crate) id: TaskId,
    /// Rendered prompt.
    pub(crate) prompt: String,
    pub(crate) timeout: Option<Duration>,
    pub(crate) submitted_at: Instant,
    pub(crate) deadline: Option<Instant>,
    responder: oneshot::Sender<TaskResult>,
}

impl Task {
    pub(crate) fn new(
        request: &TaskRequest,
        default_timeout: Option<Duration>,
    ) -> (Self, oneshot::Receiver<TaskResult>) {
        let (tx, rx) = oneshot::channel();
        let submitted_at = Instant::now();
        let timeout = request.timeout.or(default_timeout);
        let task = Self {
            id: Uuid::new_v4(),
            prompt: request.render(),
            timeout,
            submitted_at,
            deadline: timeout.map(|t| submitted_at + t),
            responder: tx,
        };
        (task, rx)
    }

    /// The caller dropped its handle.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.responder.is_closed()
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    pub(crate) fn timeout_error(&self) -> PoolError {
        PoolError::TaskTimeout {
            timeout: self.timeout.unwrap_or_default(),
        }
    }

    /// Resolve the task. Consumes it, so a task resolves at most once.
    pub(crate) fn resolve(self, result: TaskResult) {
        if self.responder.send(result).is_err() {
            log::debug!("Task {} resolved after its caller went away", self.id);
        }
    }

    pub(crate) fn fail(self, session_id: Option<SessionId>, error: PoolError, output: String) {
        let failure = TaskFailure {
            task_id: self.id,
            session_id,
            error,
            output,
        };
        self.resolve(Err(failure));
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Caller side of a submitted task.
///
/// Dropping the handle before dispatch abandons the task; it is skipped
/// without touching any session.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    deadline: Option<Instant>,
    rx: oneshot::Receiver<TaskResult>,
    shared: Arc<PoolShared>,
}

impl TaskHandle {
    pub(crate) fn new(
        id: TaskId,
        deadline: Option<Instant>,
        rx: oneshot::Receiver<TaskResult>,
        shared: Arc<PoolShared>,
    ) -> Self {
        Self {
            id,
            deadline,
            rx,
            shared,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Wait for the task's single resolution.
    ///
    /// A task still queued at its deadline is failed with a timeout here;
    /// a running task is timed out by its session.
    pub async fn wait(mut self) -> TaskResult {
        if let Some(deadline) = self.deadline {
            tokio::select! {
                result = &mut self.rx => return flatten(self.id, result),
                _ = tokio::time::sleep_until(deadline) => {}
            }
            self.shared.expire_queued(self.id).await;
        }
        let result = (&mut self.rx).await;
        flatten(self.id, result)
    }

    /// Withdraw the task if it has not been dispatched yet.
    ///
    /// Returns false when the task already reached a session or resolved.
    pub async fn cancel(self) -> bool {
        self.shared.cancel_queued(self.id).await
    }
}

fn flatten(id: TaskId, result: Result<TaskResult, oneshot::error::RecvError>) -> TaskResult {
    result.unwrap_or_else(|_| {
        Err(TaskFailure {
            task_id: id,
            session_id: None,
            error: PoolError::Shutdown,
            output: String::new(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_with_context() {
        let request = TaskRequest::new("Write tests").with_context("Story: login form");
        assert_eq!(request.render(), "Story: login form\n\nWrite tests");
        assert_eq!(TaskRequest::new("Write tests").render(), "Write tests");
        assert_eq!(
            TaskRequest::new("Write tests").with_context("  ").render(),
            "Write tests"
        );
    }

    #[test]
    fn test_validate_rejects_blank_prompt() {
        assert!(TaskRequest::new("  \n").validate().is_err());
        assert!(TaskRequest::new("go").validate().is_ok());
    }

    #[tokio::test]
    async fn test_deadline_from_request_or_default() {
        let (task, _rx) = Task::new(&TaskRequest::new("a"), Some(Duration::from_secs(600)));
        assert_eq!(task.timeout, Some(Duration::from_secs(600)));
        assert_eq!(task.deadline, Some(task.submitted_at + Duration::from_secs(600)));

        let request = TaskRequest::new("b").with_timeout(Duration::from_secs(5));
        let (task, _rx) = Task::new(&request, Some(Duration::from_secs(600)));
        assert_eq!(task.timeout, Some(Duration::from_secs(5)));

        let (task, _rx) = Task::new(&TaskRequest::new("c"), None);
        assert!(task.deadline.is_none());
        assert!(!task.is_expired(Instant::now() + Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn test_abandoned_when_receiver_dropped() {
        let (task, rx) = Task::new(&TaskRequest::new("a"), None);
        assert!(!task.is_abandoned());
        drop(rx);
        assert!(task.is_abandoned());
    }

    #[tokio::test]
    async fn test_fail_delivers_failure() {
        let (task, rx) = Task::new(&TaskRequest::new("a"), None);
        let id = task.id;
        task.fail(Some(1), PoolError::Cancelled, "partial".into());
        let failure = rx.await.unwrap().unwrap_err();
        assert_eq!(failure.task_id, id);
        assert_eq!(failure.session_id, Some(1));
        assert_eq!(failure.error, PoolError::Cancelled);
        assert_eq!(failure.output, "partial");
    }
}
