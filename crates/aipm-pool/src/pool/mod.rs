//! Session pool and dispatcher.
//!
//! Owns a fixed set of sessions and a FIFO queue of unbound tasks. All
//! queue mutations and session state transitions go through one lock, so
//! "is anything idle" and "is anything queued" are always decided together:
//! whenever a session turns idle the queue is drained into it, and a task is
//! only queued when no session is idle.
//!
//! Session I/O happens in one worker task per session, outside the lock.

mod task;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use task::{TaskHandle, TaskId, TaskOutput, TaskRequest, TaskResult};
pub(crate) use task::Task;

use crate::abnormality::{AbnormalityConfig, AbnormalityDetector};
use crate::completion::{CompletionConfig, CompletionPolicy};
use crate::error::PoolError;
use crate::resources::ResourceSampler;
use crate::session::worker::{SessionCommand, SessionWorker};
use crate::session::{ActivityTimes, ProcessLauncher, SessionActivity, SessionConfig, SessionId, SessionState};
use crate::supervisor::{self, SessionSupervisor, SupervisorConfig};

// ============================================================================
// Configuration
// ============================================================================

/// Everything the pool needs to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of sessions.
    pub size: usize,
    /// Timeout for tasks that do not set one (ms). 0 disables it.
    pub default_timeout_ms: u64,
    pub session: SessionConfig,
    pub completion: CompletionConfig,
    pub abnormality: AbnormalityConfig,
    pub supervisor: SupervisorConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 2,
            default_timeout_ms: 600_000,
            session: SessionConfig::default(),
            completion: CompletionConfig::default(),
            abnormality: AbnormalityConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_ms > 0).then(|| Duration::from_millis(self.default_timeout_ms))
    }
}

// ============================================================================
// Status
// ============================================================================

/// Point-in-time view of one session.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub id: SessionId,
    pub state: SessionState,
    pub pid: Option<u32>,
    pub generation: u64,
    pub restart_count: u32,
    pub current_task: Option<TaskId>,
    /// Time since the last output.
    pub silent_for: Option<Duration>,
    /// Time the current task has been running.
    pub task_runtime: Option<Duration>,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub pool_size: usize,
    pub idle: usize,
    pub busy: usize,
    pub restarting: usize,
    pub queued: usize,
    pub uptime: Duration,
    pub sessions: Vec<SessionStatus>,
}

/// What the monitor needs to score one busy session.
#[derive(Debug, Clone)]
pub(crate) struct BusyProbe {
    pub(crate) session: SessionId,
    pub(crate) task_id: TaskId,
    pub(crate) pid: Option<u32>,
    pub(crate) activity: ActivityTimes,
}

// ============================================================================
// Shared state
// ============================================================================

struct SessionSlot {
    id: SessionId,
    state: SessionState,
    pid: Option<u32>,
    generation: u64,
    restart_count: u32,
    current_task: Option<TaskId>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    activity: Arc<SessionActivity>,
}

struct PoolState {
    slots: Vec<SessionSlot>,
    queue: VecDeque<Task>,
    closed: bool,
}

impl PoolState {
    /// Bind queued tasks to idle sessions until one side runs out.
    fn dispatch(&mut self) {
        loop {
            let Some(idx) = self
                .slots
                .iter()
                .position(|slot| slot.state == SessionState::Idle)
            else {
                return;
            };
            let Some(task) = self.next_live_task() else {
                return;
            };

            let slot = &mut self.slots[idx];
            debug!("Dispatching task {} to session {}", task.id, slot.id);
            slot.state = SessionState::Busy;
            slot.current_task = Some(task.id);

            if let Err(mpsc::error::SendError(command)) =
                slot.commands.send(SessionCommand::Execute(task))
            {
                warn!("Session {} worker is gone", slot.id);
                slot.state = SessionState::Restarting;
                slot.current_task = None;
                if let SessionCommand::Execute(task) = command {
                    task.fail(Some(slot.id), PoolError::Shutdown, String::new());
                }
            }
        }
    }

    /// Pop the oldest task that still has a caller and time left.
    fn next_live_task(&mut self) -> Option<Task> {
        let now = Instant::now();
        while let Some(task) = self.queue.pop_front() {
            if task.is_abandoned() {
                debug!("Dropping task {}: caller went away", task.id);
                continue;
            }
            if task.is_expired(now) {
                let error = task.timeout_error();
                task.fail(None, error, String::new());
                continue;
            }
            return Some(task);
        }
        None
    }

    fn slot_mut(&mut self, id: SessionId) -> Option<&mut SessionSlot> {
        self.slots.get_mut(id)
    }

    fn remove_queued(&mut self, task_id: TaskId) -> Option<Task> {
        let idx = self.queue.iter().position(|task| task.id == task_id)?;
        self.queue.remove(idx)
    }
}

/// State shared by the pool handle, task handles and session workers.
pub(crate) struct PoolShared {
    state: Mutex<PoolState>,
    config: Arc<PoolConfig>,
    started_at: Instant,
    shutdown_tx: broadcast::Sender<()>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PoolShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolShared")
            .field("size", &self.config.size)
            .finish_non_exhaustive()
    }
}

impl PoolShared {
    /// A session finished starting (first start or restart).
    pub(crate) async fn session_ready(
        &self,
        id: SessionId,
        generation: u64,
        restart_count: u32,
        pid: Option<u32>,
    ) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.slot_mut(id) {
            slot.state = SessionState::Idle;
            slot.generation = generation;
            slot.restart_count = restart_count;
            slot.pid = pid;
            slot.current_task = None;
        }
        state.dispatch();
    }

    /// A session finished its task and is idle again.
    pub(crate) async fn task_finished(&self, id: SessionId) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.slot_mut(id) {
            slot.state = SessionState::Idle;
            slot.current_task = None;
        }
        state.dispatch();
    }

    /// A session's process is being replaced.
    pub(crate) async fn mark_restarting(&self, id: SessionId) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.slot_mut(id) {
            slot.state = SessionState::Restarting;
            slot.current_task = None;
            slot.pid = None;
        }
    }

    /// Put tasks that were dispatched to `id` but never started back at the
    /// head of the queue, oldest first.
    pub(crate) async fn requeue_unstarted(&self, id: SessionId, tasks: Vec<Task>) {
        if tasks.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        if state.closed {
            for task in tasks {
                task.fail(None, PoolError::Shutdown, String::new());
            }
            return;
        }
        info!("Session {} returned {} unstarted task(s) to the queue", id, tasks.len());
        for task in tasks.into_iter().rev() {
            state.queue.push_front(task);
        }
        state.dispatch();
    }

    /// Ask a session to abandon `task_id`, if that task is still bound to it.
    pub(crate) async fn evict(&self, id: SessionId, task_id: TaskId, error: PoolError) -> bool {
        let state = self.state.lock().await;
        let Some(slot) = state.slots.get(id) else {
            return false;
        };
        if slot.state != SessionState::Busy || slot.current_task != Some(task_id) {
            debug!("Skipping eviction of task {}: no longer on session {}", task_id, id);
            return false;
        }
        slot.commands
            .send(SessionCommand::Evict { task_id, error })
            .is_ok()
    }

    pub(crate) async fn expire_queued(&self, task_id: TaskId) {
        let task = self.state.lock().await.remove_queued(task_id);
        if let Some(task) = task {
            info!("Task {} timed out while queued", task_id);
            let error = task.timeout_error();
            task.fail(None, error, String::new());
        }
    }

    pub(crate) async fn cancel_queued(&self, task_id: TaskId) -> bool {
        let task = self.state.lock().await.remove_queued(task_id);
        match task {
            Some(task) => {
                debug!("Task {} cancelled before dispatch", task_id);
                task.fail(None, PoolError::Cancelled, String::new());
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// Pool handle
// ============================================================================

/// Cloneable handle to a running session pool.
#[derive(Debug, Clone)]
pub struct SessionPool {
    shared: Arc<PoolShared>,
}

impl SessionPool {
    /// Start `config.size` sessions. Must be called inside a Tokio runtime.
    ///
    /// Sessions begin in `Restarting` and turn idle as their processes come
    /// up; tasks submitted meanwhile are queued.
    pub fn start(config: PoolConfig, launcher: Arc<dyn ProcessLauncher>) -> Result<Self> {
        if config.size == 0 {
            bail!("pool size must be at least 1");
        }
        let policy = Arc::new(
            CompletionPolicy::from_config(&config.completion)
                .context("compiling completion domain patterns")?,
        );
        let config = Arc::new(config);
        let (shutdown_tx, _) = broadcast::channel(1);

        let mut slots = Vec::with_capacity(config.size);
        let mut receivers = Vec::with_capacity(config.size);
        for id in 0..config.size {
            let (tx, rx) = mpsc::unbounded_channel();
            let activity = Arc::new(SessionActivity::default());
            slots.push(SessionSlot {
                id,
                state: SessionState::Restarting,
                pid: None,
                generation: 0,
                restart_count: 0,
                current_task: None,
                commands: tx,
                activity: activity.clone(),
            });
            receivers.push((id, rx, activity));
        }

        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                slots,
                queue: VecDeque::new(),
                closed: false,
            }),
            config: config.clone(),
            started_at: Instant::now(),
            shutdown_tx,
            workers: std::sync::Mutex::new(Vec::new()),
        });

        let mut workers = Vec::with_capacity(config.size);
        for (id, commands, activity) in receivers {
            let supervisor = SessionSupervisor::new(id, config.clone(), launcher.clone());
            let worker = SessionWorker::new(
                id,
                config.clone(),
                policy.clone(),
                Arc::downgrade(&shared),
                commands,
                activity,
                supervisor,
            );
            workers.push(tokio::spawn(worker.run()));
        }
        *shared
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = workers;

        info!("Session pool started with {} sessions", config.size);
        Ok(Self { shared })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Accept a task. Never rejects for load; the queue is unbounded.
    ///
    /// Invalid requests and submissions after shutdown resolve as failed
    /// immediately.
    pub async fn submit(&self, request: TaskRequest) -> TaskHandle {
        let (task, rx) = Task::new(&request, self.shared.config.default_timeout());
        let handle = TaskHandle::new(task.id, task.deadline, rx, self.shared.clone());

        if let Err(error) = request.validate() {
            task.fail(None, error, String::new());
            return handle;
        }

        let mut state = self.shared.state.lock().await;
        if state.closed {
            drop(state);
            task.fail(None, PoolError::Shutdown, String::new());
            return handle;
        }
        debug!("Task {} accepted", task.id);
        state.queue.push_back(task);
        state.dispatch();
        handle
    }

    /// Submit and wait.
    pub async fn execute(&self, request: TaskRequest) -> TaskResult {
        self.submit(request).await.wait().await
    }

    pub async fn status(&self) -> PoolStatus {
        let now = Instant::now();
        let state = self.shared.state.lock().await;

        let sessions: Vec<SessionStatus> = state
            .slots
            .iter()
            .map(|slot| {
                let activity = slot.activity.snapshot();
                SessionStatus {
                    id: slot.id,
                    state: slot.state,
                    pid: slot.pid,
                    generation: slot.generation,
                    restart_count: slot.restart_count,
                    current_task: slot.current_task,
                    silent_for: activity
                        .last_activity_at
                        .map(|at| now.saturating_duration_since(at)),
                    task_runtime: activity
                        .task_started_at
                        .filter(|_| slot.state == SessionState::Busy)
                        .map(|at| now.saturating_duration_since(at)),
                }
            })
            .collect();

        let count = |wanted: SessionState| sessions.iter().filter(|s| s.state == wanted).count();
        PoolStatus {
            pool_size: sessions.len(),
            idle: count(SessionState::Idle),
            busy: count(SessionState::Busy),
            restarting: count(SessionState::Restarting),
            queued: state.queue.len(),
            uptime: now.saturating_duration_since(self.shared.started_at),
            sessions,
        }
    }

    pub(crate) async fn busy_probes(&self) -> Vec<BusyProbe> {
        let state = self.shared.state.lock().await;
        state
            .slots
            .iter()
            .filter(|slot| slot.state == SessionState::Busy)
            .filter_map(|slot| {
                Some(BusyProbe {
                    session: slot.id,
                    task_id: slot.current_task?,
                    pid: slot.pid,
                    activity: slot.activity.snapshot(),
                })
            })
            .collect()
    }

    pub(crate) async fn evict(&self, id: SessionId, task_id: TaskId, error: PoolError) -> bool {
        self.shared.evict(id, task_id, error).await
    }

    /// Start the abnormality monitor, unless disabled in config.
    pub fn spawn_monitor(&self, sampler: Arc<dyn ResourceSampler>) -> Option<JoinHandle<()>> {
        let config = &self.shared.config.abnormality;
        if !config.enabled {
            info!("Abnormality monitor disabled");
            return None;
        }
        let detector = AbnormalityDetector::new(config.clone());
        let shutdown = self.shared.shutdown_tx.subscribe();
        Some(tokio::spawn(supervisor::monitor_loop(
            self.clone(),
            detector,
            sampler,
            shutdown,
        )))
    }

    /// Stop accepting work, fail pending tasks and stop every session.
    pub async fn shutdown(&self) {
        let _ = self.shared.shutdown_tx.send(());
        {
            let mut state = self.shared.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            let pending: Vec<Task> = state.queue.drain(..).collect();
            if !pending.is_empty() {
                info!("Failing {} queued task(s) on shutdown", pending.len());
            }
            for task in pending {
                task.fail(None, PoolError::Shutdown, String::new());
            }
            for slot in &state.slots {
                let _ = slot.commands.send(SessionCommand::Shutdown);
            }
        }

        let workers = std::mem::take(
            &mut *self
                .shared
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let budget = self.shared.config.supervisor.termination_budget() + Duration::from_secs(1);
        // Workers terminate their processes concurrently.
        if tokio::time::timeout(budget, futures::future::join_all(workers))
            .await
            .is_err()
        {
            warn!("Session workers did not stop within {}ms", budget.as_millis());
        }
        info!("Session pool stopped");
    }
}
