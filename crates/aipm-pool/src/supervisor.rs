//! Session supervision.
//!
//! - Launching a session's process, retrying failed starts with a fixed delay
//! - Rate limiting launches of one session
//! - Stopping a process with an interrupt / SIGTERM / SIGKILL ladder
//! - The abnormality monitor loop, which only reads session state and asks
//!   the pool to evict stuck tasks

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};

use crate::abnormality::{AbnormalityDetector, AbnormalityScore, SessionSignals};
use crate::error::PoolError;
use crate::pool::{PoolConfig, SessionPool};
use crate::resources::ResourceSampler;
use crate::session::worker::await_ready;
use crate::session::{ExitInfo, LaunchedProcess, ProcessEvent, ProcessLauncher, ProcessSignal, SessionId};

/// Wait for the process to be reaped after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Ctrl+C as typed into a terminal.
const INTERRUPT: &[u8] = &[0x03];

// ============================================================================
// Configuration
// ============================================================================

/// Restart and termination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Minimum gap between two launches of the same session (ms).
    pub restart_backoff_ms: u64,
    /// Delay before retrying a failed start (ms).
    pub start_retry_ms: u64,
    /// Send Ctrl+C on stdin before signalling.
    pub interrupt_before_terminate: bool,
    /// Wait after the interrupt (ms).
    pub interrupt_wait_ms: u64,
    /// Wait after SIGTERM before SIGKILL (ms).
    pub grace_period_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_backoff_ms: 2_000,
            start_retry_ms: 1_500,
            interrupt_before_terminate: true,
            interrupt_wait_ms: 2_000,
            grace_period_ms: 5_000,
        }
    }
}

impl SupervisorConfig {
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn start_retry(&self) -> Duration {
        Duration::from_millis(self.start_retry_ms)
    }

    /// Longest a termination can take.
    pub fn termination_budget(&self) -> Duration {
        let interrupt = if self.interrupt_before_terminate {
            Duration::from_millis(self.interrupt_wait_ms)
        } else {
            Duration::ZERO
        };
        interrupt + Duration::from_millis(self.grace_period_ms) + KILL_WAIT
    }
}

// ============================================================================
// Restart bookkeeping
// ============================================================================

/// Why a session's process is being replaced.
#[derive(Debug, Clone, PartialEq)]
pub enum RestartReason {
    /// The process exited on its own.
    ProcessExit(ExitInfo),
    /// The bound task's deadline passed.
    TaskTimeout,
    /// The pool evicted the bound task.
    Evicted(PoolError),
    /// Writing the prompt failed.
    InputClosed(String),
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProcessExit(info) => write!(f, "process {}", info),
            Self::TaskTimeout => write!(f, "task timed out"),
            Self::Evicted(err) => write!(f, "evicted: {}", err),
            Self::InputClosed(err) => write!(f, "input closed: {}", err),
        }
    }
}

/// Launch history of one session.
#[derive(Debug, Clone, Default)]
pub struct RestartTracker {
    generation: u64,
    restart_count: u32,
    last_attempt: Option<Instant>,
}

impl RestartTracker {
    /// Number of processes successfully started for this session.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of times a running process was replaced.
    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// How long to hold off before the next launch attempt.
    pub fn launch_delay(&self, now: Instant, backoff: Duration) -> Duration {
        match self.last_attempt {
            Some(last) => (last + backoff).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    pub fn record_attempt(&mut self, now: Instant) {
        self.last_attempt = Some(now);
    }

    pub fn record_started(&mut self) {
        self.generation += 1;
    }

    pub fn record_restart(&mut self) {
        self.restart_count += 1;
    }
}

// ============================================================================
// Per-session supervisor
// ============================================================================

/// Starts and stops the processes of one session.
pub(crate) struct SessionSupervisor {
    session: SessionId,
    config: Arc<PoolConfig>,
    launcher: Arc<dyn ProcessLauncher>,
    tracker: RestartTracker,
}

impl SessionSupervisor {
    pub(crate) fn new(
        session: SessionId,
        config: Arc<PoolConfig>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            session,
            config,
            launcher,
            tracker: RestartTracker::default(),
        }
    }

    pub(crate) fn tracker(&self) -> &RestartTracker {
        &self.tracker
    }

    pub(crate) fn record_restart(&mut self) {
        self.tracker.record_restart();
    }

    /// Launch a ready process, retrying until one comes up.
    ///
    /// Never gives up; the caller races this against shutdown. Dropping the
    /// future kills any half-started process.
    pub(crate) async fn start(&mut self) -> LaunchedProcess {
        let supervisor = &self.config.supervisor;
        loop {
            let delay = self
                .tracker
                .launch_delay(Instant::now(), supervisor.restart_backoff());
            if !delay.is_zero() {
                debug!(
                    "Session {} waiting {}ms before launch",
                    self.session,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            self.tracker.record_attempt(Instant::now());
            match self.try_start().await {
                Ok(process) => {
                    self.tracker.record_started();
                    info!(
                        "Session {} ready (generation {}, pid {:?})",
                        self.session,
                        self.tracker.generation(),
                        process.pid
                    );
                    return process;
                }
                Err(e) => {
                    warn!(
                        "{}; retrying in {}ms",
                        e,
                        supervisor.start_retry().as_millis()
                    );
                    tokio::time::sleep(supervisor.start_retry()).await;
                }
            }
        }
    }

    async fn try_start(&self) -> Result<LaunchedProcess, PoolError> {
        let mut process =
            self.launcher
                .launch(self.session)
                .await
                .map_err(|e| PoolError::ProcessStart {
                    session: self.session,
                    message: format!("{e:#}"),
                })?;

        if let Err(e) = await_ready(&mut process, &self.config.session, self.session).await {
            self.terminate(process).await;
            return Err(e);
        }
        Ok(process)
    }

    /// Stop `process`: interrupt, then SIGTERM, then SIGKILL.
    pub(crate) async fn terminate(&self, mut process: LaunchedProcess) -> Option<ExitInfo> {
        let config = &self.config.supervisor;

        if config.interrupt_before_terminate && process.send_raw(INTERRUPT).is_ok() {
            let wait = Duration::from_millis(config.interrupt_wait_ms);
            if let Some(info) = wait_for_exit(&mut process.events, wait).await {
                debug!("Session {} stopped after interrupt: {}", self.session, info);
                return Some(info);
            }
        }

        if process.signal(ProcessSignal::Terminate) {
            let grace = Duration::from_millis(config.grace_period_ms);
            if let Some(info) = wait_for_exit(&mut process.events, grace).await {
                debug!("Session {} stopped: {}", self.session, info);
                return Some(info);
            }
            warn!(
                "Session {} ignored SIGTERM for {}ms, killing",
                self.session, config.grace_period_ms
            );
        }

        process.signal(ProcessSignal::Kill);
        let info = wait_for_exit(&mut process.events, KILL_WAIT).await;
        if info.is_none() {
            warn!("Timeout waiting for session {} process to exit", self.session);
        }
        info
    }
}

/// Drain events until the exit event, a closed stream or `limit`.
async fn wait_for_exit(
    events: &mut mpsc::Receiver<ProcessEvent>,
    limit: Duration,
) -> Option<ExitInfo> {
    let drain = async {
        while let Some(event) = events.recv().await {
            if let ProcessEvent::Exited(info) = event {
                return info;
            }
        }
        ExitInfo::default()
    };
    tokio::time::timeout(limit, drain).await.ok()
}

// ============================================================================
// Abnormality monitor
// ============================================================================

/// Periodically score busy sessions and evict the stuck ones.
pub async fn monitor_loop(
    pool: SessionPool,
    detector: AbnormalityDetector,
    sampler: Arc<dyn ResourceSampler>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(detector.config().interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    info!(
        "Abnormality monitor running every {}ms",
        detector.config().interval_ms
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                check_sessions(&pool, &detector, sampler.as_ref()).await;
            }
            _ = shutdown.recv() => {
                info!("Abnormality monitor stopping");
                break;
            }
        }
    }
}

/// One monitor pass. Returns the sessions that were evicted.
pub async fn check_sessions(
    pool: &SessionPool,
    detector: &AbnormalityDetector,
    sampler: &dyn ResourceSampler,
) -> Vec<(SessionId, AbnormalityScore)> {
    let probes = pool.busy_probes().await;
    let live: Vec<u32> = probes.iter().filter_map(|probe| probe.pid).collect();
    sampler.retain(&live);

    let mut evicted = Vec::new();
    for probe in probes {
        let now = Instant::now();
        let resources = match probe.pid {
            Some(pid) => sampler.sample(pid).await,
            None => None,
        };
        let signals = SessionSignals {
            silence: probe
                .activity
                .last_activity_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or_default(),
            task_runtime: probe
                .activity
                .task_started_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or_default(),
            resources,
        };

        let score = detector.score(&signals);
        debug!("Session {} abnormality score {}", probe.session, score);
        if !detector.is_abnormal(&score) {
            continue;
        }

        warn!(
            "Session {} looks stuck on task {} (score {})",
            probe.session, probe.task_id, score
        );
        let error = PoolError::AbnormalSession {
            session: probe.session,
            score: score.total,
        };
        if pool.evict(probe.session, probe.task_id, error).await {
            evicted.push((probe.session, score));
        }
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_launch_is_immediate() {
        let tracker = RestartTracker::default();
        assert_eq!(
            tracker.launch_delay(Instant::now(), Duration::from_secs(2)),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn test_launches_are_rate_limited() {
        let mut tracker = RestartTracker::default();
        let start = Instant::now();
        tracker.record_attempt(start);

        let backoff = Duration::from_secs(2);
        assert_eq!(
            tracker.launch_delay(start + Duration::from_millis(500), backoff),
            Duration::from_millis(1500)
        );
        assert_eq!(
            tracker.launch_delay(start + Duration::from_secs(3), backoff),
            Duration::ZERO
        );
    }

    #[test]
    fn test_generation_and_restart_counts() {
        let mut tracker = RestartTracker::default();
        tracker.record_started();
        assert_eq!(tracker.generation(), 1);
        assert_eq!(tracker.restart_count(), 0);

        tracker.record_restart();
        tracker.record_started();
        assert_eq!(tracker.generation(), 2);
        assert_eq!(tracker.restart_count(), 1);
    }

    #[test]
    fn test_termination_budget() {
        let config = SupervisorConfig::default();
        assert_eq!(config.termination_budget(), Duration::from_secs(12));

        let config = SupervisorConfig {
            interrupt_before_terminate: false,
            ..SupervisorConfig::default()
        };
        assert_eq!(config.termination_budget(), Duration::from_secs(10));
    }

    #[test]
    fn test_restart_reason_display() {
        let reason = RestartReason::ProcessExit(ExitInfo {
            code: Some(2),
            signal: None,
        });
        assert_eq!(reason.to_string(), "process exited with code 2");
        assert_eq!(RestartReason::TaskTimeout.to_string(), "task timed out");
    }

    #[tokio::test]
    async fn test_wait_for_exit_skips_output() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(ProcessEvent::Output("bye".into())).await.unwrap();
        tx.send(ProcessEvent::Exited(ExitInfo {
            code: Some(0),
            signal: None,
        }))
        .await
        .unwrap();

        let info = wait_for_exit(&mut rx, Duration::from_secs(1)).await;
        assert_eq!(info.map(|i| i.code), Some(Some(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_exit_times_out() {
        let (_tx, mut rx) = mpsc::channel::<ProcessEvent>(8);
        assert!(wait_for_exit(&mut rx, Duration::from_secs(1)).await.is_none());
    }
}
