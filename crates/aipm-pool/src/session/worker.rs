//! Per-session worker.
//!
//! One worker task per session owns the session's process. It starts the
//! process through the supervisor, reports readiness to the pool, executes
//! bound tasks and restarts the process when a task times out, is evicted or
//! the process dies. It talks to the pool only through the shared state and
//! receives work only through its command channel.

use std::sync::{Arc, Weak};

use log::{debug, info, trace, warn};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use super::{
    AnsiStripper, ExitInfo, LaunchedProcess, ProcessEvent, SessionActivity, SessionConfig,
    SessionId,
};
use crate::completion::{CompletionDetector, CompletionPolicy, TaskClock, Verdict};
use crate::error::PoolError;
use crate::pool::{PoolConfig, PoolShared, Task, TaskId, TaskOutput};
use crate::supervisor::{RestartReason, SessionSupervisor};

/// Keeps at most this much startup output while looking for the ready pattern.
const READY_SCAN_LIMIT: usize = 8192;

/// Messages from the pool to a session worker.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// Run a task. Only sent while the pool has the session marked busy.
    Execute(Task),
    /// Abandon `task_id` and restart, if it is still the current task.
    Evict { task_id: TaskId, error: PoolError },
    /// Stop the process and exit.
    Shutdown,
}

/// A bound task cut short, waiting to be resolved as failed.
struct Interrupted {
    task: Task,
    error: PoolError,
    output: String,
}

enum Stop {
    Shutdown(Option<Interrupted>),
    Restart(RestartReason, Option<Interrupted>),
}

enum Executed {
    Completed(Task, TaskOutput),
    Stopped(Stop),
}

pub(crate) struct SessionWorker {
    id: SessionId,
    config: Arc<PoolConfig>,
    policy: Arc<CompletionPolicy>,
    pool: Weak<PoolShared>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    activity: Arc<SessionActivity>,
    supervisor: SessionSupervisor,
}

impl SessionWorker {
    pub(crate) fn new(
        id: SessionId,
        config: Arc<PoolConfig>,
        policy: Arc<CompletionPolicy>,
        pool: Weak<PoolShared>,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        activity: Arc<SessionActivity>,
        supervisor: SessionSupervisor,
    ) -> Self {
        Self {
            id,
            config,
            policy,
            pool,
            commands,
            activity,
            supervisor,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("Session {} worker started", self.id);

        loop {
            let mut process = tokio::select! {
                process = self.supervisor.start() => process,
                _ = drain_until_shutdown(self.id, &mut self.commands) => break,
            };

            let Some(pool) = self.pool.upgrade() else {
                self.supervisor.terminate(process).await;
                break;
            };
            let tracker = self.supervisor.tracker();
            pool.session_ready(
                self.id,
                tracker.generation(),
                tracker.restart_count(),
                process.pid,
            )
            .await;
            drop(pool);

            let mut stripper = AnsiStripper::new(self.config.session.strip_ansi);
            match self.serve(&mut process, &mut stripper).await {
                Stop::Shutdown(interrupted) => {
                    if let Some(interrupted) = interrupted {
                        self.resolve_failed(interrupted);
                    }
                    self.supervisor.terminate(process).await;
                    break;
                }
                Stop::Restart(reason, interrupted) => {
                    warn!("Session {} restarting: {}", self.id, reason);
                    let mut shutdown = false;
                    if let Some(pool) = self.pool.upgrade() {
                        pool.mark_restarting(self.id).await;
                        let (unstarted, stop) = self.take_unstarted();
                        shutdown = stop;
                        pool.requeue_unstarted(self.id, unstarted).await;
                    }
                    if let Some(interrupted) = interrupted {
                        self.resolve_failed(interrupted);
                    }
                    self.activity.end_task();
                    self.supervisor.terminate(process).await;
                    if shutdown {
                        break;
                    }
                    self.supervisor.record_restart();
                }
            }
        }

        info!("Session {} stopped", self.id);
    }

    /// Handle commands and idle output until the process has to go.
    async fn serve(&mut self, process: &mut LaunchedProcess, stripper: &mut AnsiStripper) -> Stop {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Execute(task)) => {
                        match self.execute(process, stripper, task).await {
                            Executed::Completed(task, output) => {
                                info!(
                                    "Session {} finished task {} ({}, {}ms)",
                                    self.id,
                                    task.id,
                                    output.completion,
                                    output.elapsed.as_millis()
                                );
                                self.activity.end_task();
                                if let Some(pool) = self.pool.upgrade() {
                                    pool.task_finished(self.id).await;
                                }
                                task.resolve(Ok(output));
                            }
                            Executed::Stopped(stop) => return stop,
                        }
                    }
                    Some(SessionCommand::Evict { task_id, .. }) => {
                        debug!("Session {} ignoring stale eviction of task {}", self.id, task_id);
                    }
                    Some(SessionCommand::Shutdown) | None => return Stop::Shutdown(None),
                },
                event = process.events.recv() => match event {
                    Some(ProcessEvent::Output(chunk)) => {
                        self.activity.touch(Instant::now());
                        let text = stripper.push(&chunk);
                        trace!("[session {} idle] {}", self.id, text);
                        answer_prompts(process, &self.config.session, &text, self.id);
                    }
                    Some(ProcessEvent::Exited(info)) => {
                        return Stop::Restart(RestartReason::ProcessExit(info), None);
                    }
                    None => {
                        return Stop::Restart(RestartReason::ProcessExit(ExitInfo::default()), None);
                    }
                },
            }
        }
    }

    /// Run one task to a verdict.
    async fn execute(
        &mut self,
        process: &mut LaunchedProcess,
        stripper: &mut AnsiStripper,
        task: Task,
    ) -> Executed {
        let started = Instant::now();
        let queued_for = started.saturating_duration_since(task.submitted_at);
        let mut last_activity = started;
        let mut detector = CompletionDetector::new(self.policy.clone());
        self.activity.begin_task(started);

        info!(
            "Session {} running task {} (queued {}ms)",
            self.id,
            task.id,
            queued_for.as_millis()
        );

        let prompt = self.policy.decorate_prompt(&task.prompt);
        if let Err(e) = process.send_line(&prompt, &self.config.session.line_ending) {
            let error = PoolError::ProcessExit {
                session: self.id,
                status: format!("stopped reading input ({e})"),
            };
            let interrupted = Interrupted {
                task,
                error,
                output: String::new(),
            };
            return Executed::Stopped(Stop::Restart(
                RestartReason::InputClosed(e.to_string()),
                Some(interrupted),
            ));
        }

        let poll = self.config.completion.poll_interval();
        let mut ticker = tokio::time::interval_at(started + poll, poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let deadline = task.deadline;
        let deadline_sleep = tokio::time::sleep_until(deadline.unwrap_or(started));
        tokio::pin!(deadline_sleep);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Evict { task_id, error }) if task_id == task.id => {
                        let output = take_output(detector, stripper);
                        let reason = RestartReason::Evicted(error.clone());
                        let interrupted = Interrupted { task, error, output };
                        return Executed::Stopped(Stop::Restart(reason, Some(interrupted)));
                    }
                    Some(SessionCommand::Evict { task_id, .. }) => {
                        debug!("Session {} ignoring stale eviction of task {}", self.id, task_id);
                        continue;
                    }
                    Some(SessionCommand::Execute(other)) => {
                        warn!("Session {} got task {} while busy", self.id, other.id);
                        other.fail(
                            Some(self.id),
                            PoolError::ProcessStart {
                                session: self.id,
                                message: "session is busy".to_string(),
                            },
                            String::new(),
                        );
                        continue;
                    }
                    Some(SessionCommand::Shutdown) | None => {
                        let output = take_output(detector, stripper);
                        let interrupted = Interrupted { task, error: PoolError::Shutdown, output };
                        return Executed::Stopped(Stop::Shutdown(Some(interrupted)));
                    }
                },
                event = process.events.recv() => match event {
                    Some(ProcessEvent::Output(chunk)) => {
                        last_activity = Instant::now();
                        self.activity.touch(last_activity);
                        let text = stripper.push(&chunk);
                        trace!("[session {}] {}", self.id, text);
                        answer_prompts(process, &self.config.session, &text, self.id);
                        detector.observe(&text);
                    }
                    Some(ProcessEvent::Exited(info)) => {
                        return self.process_died(task, info, take_output(detector, stripper));
                    }
                    None => {
                        return self.process_died(task, ExitInfo::default(), take_output(detector, stripper));
                    }
                },
                _ = ticker.tick() => {}
                _ = &mut deadline_sleep, if deadline.is_some() => {}
            }

            let clock = TaskClock {
                now: Instant::now(),
                last_activity,
                deadline,
            };
            match detector.evaluate(clock) {
                Verdict::Pending => {}
                Verdict::Complete {
                    kind,
                    possibly_incomplete,
                } => {
                    if possibly_incomplete {
                        info!(
                            "Session {} task {} went quiet; treating as possibly incomplete",
                            self.id, task.id
                        );
                    }
                    let output = TaskOutput {
                        task_id: task.id,
                        session_id: self.id,
                        output: take_output(detector, stripper),
                        completion: kind,
                        possibly_incomplete,
                        elapsed: clock.now.saturating_duration_since(started),
                        queued_for,
                    };
                    return Executed::Completed(task, output);
                }
                Verdict::TimedOut => {
                    warn!("Session {} task {} timed out", self.id, task.id);
                    let error = task.timeout_error();
                    let output = take_output(detector, stripper);
                    let interrupted = Interrupted { task, error, output };
                    return Executed::Stopped(Stop::Restart(
                        RestartReason::TaskTimeout,
                        Some(interrupted),
                    ));
                }
            }
        }
    }

    fn process_died(&self, task: Task, info: ExitInfo, output: String) -> Executed {
        let error = PoolError::ProcessExit {
            session: self.id,
            status: info.to_string(),
        };
        let interrupted = Interrupted {
            task,
            error,
            output,
        };
        Executed::Stopped(Stop::Restart(
            RestartReason::ProcessExit(info),
            Some(interrupted),
        ))
    }

    /// Collect tasks dispatched to this session that never reached the
    /// process. The pool has already marked the session restarting, so
    /// nothing more can arrive. Also reports whether shutdown was requested.
    fn take_unstarted(&mut self) -> (Vec<Task>, bool) {
        let mut unstarted = Vec::new();
        let mut shutdown = false;
        while let Ok(command) = self.commands.try_recv() {
            match command {
                SessionCommand::Execute(task) => {
                    debug!("Session {} returning unstarted task {}", self.id, task.id);
                    unstarted.push(task);
                }
                SessionCommand::Evict { .. } => {}
                SessionCommand::Shutdown => shutdown = true,
            }
        }
        (unstarted, shutdown)
    }

    fn resolve_failed(&self, interrupted: Interrupted) {
        let Interrupted {
            task,
            error,
            output,
        } = interrupted;
        warn!("Session {} task {} failed: {}", self.id, task.id, error);
        task.fail(Some(self.id), error, output);
    }
}

fn take_output(detector: CompletionDetector, stripper: &mut AnsiStripper) -> String {
    let mut output = detector.into_output();
    output.push_str(&stripper.finish());
    output
}

/// Reject work while no process is running; return on shutdown.
async fn drain_until_shutdown(
    session: SessionId,
    commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
) {
    loop {
        match commands.recv().await {
            Some(SessionCommand::Execute(task)) => {
                warn!("Session {} got task {} while restarting", session, task.id);
                task.fail(
                    Some(session),
                    PoolError::ProcessStart {
                        session,
                        message: "session is restarting".to_string(),
                    },
                    String::new(),
                );
            }
            Some(SessionCommand::Evict { .. }) => {}
            Some(SessionCommand::Shutdown) | None => return,
        }
    }
}

/// Answer interactive permission prompts found in `text`.
pub(crate) fn answer_prompts(
    process: &LaunchedProcess,
    config: &SessionConfig,
    text: &str,
    session: SessionId,
) {
    for reply in &config.auto_replies {
        if reply.pattern.is_empty() || !text.contains(&reply.pattern) {
            continue;
        }
        debug!(
            "Session {} answering '{}' with '{}'",
            session, reply.pattern, reply.reply
        );
        if let Err(e) = process.send_line(&reply.reply, &config.line_ending) {
            warn!("Session {} failed to send auto reply: {}", session, e);
        }
    }
}

/// Wait until a freshly launched process is ready for its first prompt.
///
/// With a ready pattern, waits for it up to the startup timeout. Without
/// one, waits out the settle delay. Startup output is never part of a task.
pub(crate) async fn await_ready(
    process: &mut LaunchedProcess,
    config: &SessionConfig,
    session: SessionId,
) -> Result<(), PoolError> {
    let pattern = config.ready_pattern.as_deref().filter(|p| !p.is_empty());
    let deadline = Instant::now()
        + match pattern {
            Some(_) => config.startup_timeout(),
            None => config.startup_settle(),
        };
    let start_error = |message: String| PoolError::ProcessStart { session, message };

    let mut stripper = AnsiStripper::new(config.strip_ansi);
    let mut seen = String::new();

    loop {
        tokio::select! {
            event = process.events.recv() => match event {
                Some(ProcessEvent::Output(chunk)) => {
                    let text = stripper.push(&chunk);
                    trace!("[session {} startup] {}", session, text);
                    answer_prompts(process, config, &text, session);

                    if let Some(pattern) = pattern {
                        seen.push_str(&text);
                        if seen.contains(pattern) {
                            return Ok(());
                        }
                        trim_front(&mut seen, READY_SCAN_LIMIT);
                    }
                }
                Some(ProcessEvent::Exited(info)) => {
                    return Err(start_error(format!("process {} during startup", info)));
                }
                None => return Err(start_error("process output closed during startup".to_string())),
            },
            _ = tokio::time::sleep_until(deadline) => {
                return match pattern {
                    Some(pattern) => Err(start_error(format!(
                        "'{}' not seen within {}ms",
                        pattern, config.startup_timeout_ms
                    ))),
                    None => Ok(()),
                };
            }
        }
    }
}

fn trim_front(text: &mut String, limit: usize) {
    if text.len() <= limit {
        return;
    }
    let mut cut = text.len() - limit / 2;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text.drain(..cut);
}
