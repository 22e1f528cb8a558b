//! Shared test utilities for pool and API integration tests.
//!
//! The fake launcher stands in for the assistant CLI: every launch produces
//! an in-memory "process" that reads prompt lines from its stdin and plays
//! back a script of output steps.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aipm_pool::abnormality::AbnormalityConfig;
use aipm_pool::api::{AppState, create_router};
use aipm_pool::resources::{ResourceSample, ResourceSampler};
use aipm_pool::session::{ExitInfo, LaunchedProcess, ProcessEvent, ProcessSignal, SessionConfig};
use aipm_pool::supervisor::SupervisorConfig;
use aipm_pool::{PoolConfig, PoolStatus, ProcessLauncher, SessionId, SessionPool};
use async_trait::async_trait;
use axum::Router;
use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines};
use tokio::sync::mpsc;

/// One thing the fake assistant does in reply to a prompt.
#[derive(Debug, Clone)]
pub enum Step {
    /// Write a chunk of output.
    Emit(String),
    /// Go quiet for a while.
    Sleep(Duration),
    /// Read the next input line (an auto reply) before continuing.
    AwaitLine,
    /// Go quiet until signalled.
    Hang,
    /// Exit with the given code.
    Exit(i32),
}

pub fn emit(text: &str) -> Step {
    Step::Emit(text.to_string())
}

pub fn sleep_secs(secs: u64) -> Step {
    Step::Sleep(Duration::from_secs(secs))
}

const POLL: Duration = Duration::from_millis(100);

type Script = dyn Fn(&str) -> Vec<Step> + Send + Sync;

/// Launcher producing scripted in-memory processes.
pub struct FakeLauncher {
    script: Arc<Script>,
    startup: Vec<Step>,
    reads_input: bool,
    fail_first: AtomicUsize,
    launches: AtomicUsize,
    next_pid: AtomicU32,
    inputs: Arc<Mutex<Vec<(SessionId, String)>>>,
}

impl FakeLauncher {
    /// Every input line runs `script(line)`.
    pub fn new(script: impl Fn(&str) -> Vec<Step> + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            startup: Vec::new(),
            reads_input: true,
            fail_first: AtomicUsize::new(0),
            launches: AtomicUsize::new(0),
            next_pid: AtomicU32::new(4000),
            inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// An assistant that echoes the prompt and prints the completion marker.
    pub fn completing() -> Self {
        Self::new(|line| vec![emit(&format!("working on: {line}\n")), emit("TASK COMPLETE\n")])
    }

    /// Output played back right after launch, before any prompt.
    pub fn with_startup(mut self, steps: Vec<Step>) -> Self {
        self.startup = steps;
        self
    }

    /// Processes that never read their stdin, so writes back up.
    pub fn ignoring_input(mut self) -> Self {
        self.reads_input = false;
        self
    }

    /// Make the first `n` launches fail.
    pub fn failing_first(self, n: usize) -> Self {
        self.fail_first.store(n, Ordering::SeqCst);
        self
    }

    /// Launch attempts so far, failed ones included.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Every input line received, by session.
    pub fn inputs(&self) -> Vec<(SessionId, String)> {
        self.inputs.lock().unwrap().clone()
    }

    /// Input lines received by one session.
    pub fn inputs_for(&self, session: SessionId) -> Vec<String> {
        self.inputs()
            .into_iter()
            .filter(|(id, _)| *id == session)
            .map(|(_, line)| line)
            .collect()
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn launch(&self, session: SessionId) -> anyhow::Result<LaunchedProcess> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("fake launch failure");
        }

        let (stdin, process_side) = tokio::io::duplex(64 * 1024);
        let (events_tx, events_rx) = mpsc::channel(256);
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();

        let fake = FakeProcess {
            session,
            reads_input: self.reads_input,
            script: self.script.clone(),
            inputs: self.inputs.clone(),
            events: events_tx,
            signals: signals_rx,
            lines: BufReader::new(process_side).lines(),
        };
        tokio::spawn(fake.run(self.startup.clone()));

        let pid = Some(self.next_pid.fetch_add(1, Ordering::SeqCst));
        Ok(LaunchedProcess::new(session, pid, stdin, events_rx, signals_tx))
    }
}

struct FakeProcess {
    session: SessionId,
    reads_input: bool,
    script: Arc<Script>,
    inputs: Arc<Mutex<Vec<(SessionId, String)>>>,
    events: mpsc::Sender<ProcessEvent>,
    signals: mpsc::UnboundedReceiver<ProcessSignal>,
    lines: Lines<BufReader<DuplexStream>>,
}

enum Outcome {
    Continue,
    Exit(ExitInfo),
}

impl FakeProcess {
    async fn run(mut self, startup: Vec<Step>) {
        let exit = match self.play(startup).await {
            Outcome::Exit(info) => info,
            // keeps its end of stdin open without ever reading it
            Outcome::Continue if !self.reads_input => signalled(self.signals.recv().await),
            Outcome::Continue => loop {
                let line = tokio::select! {
                    line = read_line(&mut self.lines, &self.inputs, self.session) => line,
                    signal = self.signals.recv() => break signalled(signal),
                };
                let Some(line) = line else {
                    // stdin closed; wait to be stopped
                    break signalled(self.signals.recv().await);
                };
                let steps = (self.script)(&line);
                if let Outcome::Exit(info) = self.play(steps).await {
                    break info;
                }
            },
        };
        let _ = self.events.send(ProcessEvent::Exited(exit)).await;
    }

    async fn play(&mut self, steps: Vec<Step>) -> Outcome {
        for step in steps {
            match step {
                Step::Emit(text) => {
                    let _ = self.events.send(ProcessEvent::Output(text)).await;
                }
                Step::Sleep(duration) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        signal = self.signals.recv() => return Outcome::Exit(signalled(signal)),
                    }
                }
                Step::AwaitLine => {
                    tokio::select! {
                        _ = read_line(&mut self.lines, &self.inputs, self.session) => {}
                        signal = self.signals.recv() => return Outcome::Exit(signalled(signal)),
                    }
                }
                Step::Hang => return Outcome::Exit(signalled(self.signals.recv().await)),
                Step::Exit(code) => {
                    return Outcome::Exit(ExitInfo {
                        code: Some(code),
                        signal: None,
                    });
                }
            }
        }
        Outcome::Continue
    }
}

async fn read_line(
    lines: &mut Lines<BufReader<DuplexStream>>,
    inputs: &Mutex<Vec<(SessionId, String)>>,
    session: SessionId,
) -> Option<String> {
    let line = lines.next_line().await.ok().flatten()?;
    inputs.lock().unwrap().push((session, line.clone()));
    Some(line)
}

fn signalled(signal: Option<ProcessSignal>) -> ExitInfo {
    let signal = match signal {
        Some(ProcessSignal::Terminate) => 15,
        Some(ProcessSignal::Kill) | None => 9,
    };
    ExitInfo {
        code: None,
        signal: Some(signal),
    }
}

/// Sampler reporting a fixed reading for every pid.
#[derive(Debug, Clone, Copy)]
pub struct FakeSampler {
    pub cpu_percent: Option<f64>,
    pub rss_bytes: u64,
}

impl FakeSampler {
    /// An idle process: 0% CPU, 50MB resident.
    pub fn idle() -> Self {
        Self {
            cpu_percent: Some(0.0),
            rss_bytes: 50 * 1024 * 1024,
        }
    }

    /// A process visibly doing work.
    pub fn busy() -> Self {
        Self {
            cpu_percent: Some(40.0),
            rss_bytes: 50 * 1024 * 1024,
        }
    }
}

#[async_trait]
impl ResourceSampler for FakeSampler {
    async fn sample(&self, _pid: u32) -> Option<ResourceSample> {
        Some(ResourceSample {
            cpu_percent: self.cpu_percent,
            rss_bytes: self.rss_bytes,
        })
    }
}

/// Pool config suited to the fake launcher.
pub fn test_config(size: usize) -> PoolConfig {
    PoolConfig {
        size,
        session: SessionConfig {
            command: "fake-assistant".to_string(),
            args: Vec::new(),
            startup_settle_ms: 0,
            auto_replies: Vec::new(),
            ..SessionConfig::default()
        },
        abnormality: AbnormalityConfig::default(),
        supervisor: SupervisorConfig {
            interrupt_before_terminate: false,
            ..SupervisorConfig::default()
        },
        ..PoolConfig::default()
    }
}

/// Start a pool and wait until every session is idle.
pub async fn start_pool(config: PoolConfig, launcher: Arc<FakeLauncher>) -> SessionPool {
    let size = config.size;
    let pool = SessionPool::start(config, launcher).expect("pool starts");
    wait_for_idle(&pool, size).await;
    pool
}

pub async fn wait_for_idle(pool: &SessionPool, count: usize) {
    let ready = wait_for_status(pool, |status| status.idle == count).await;
    assert!(ready, "sessions did not become idle: {:?}", pool.status().await);
}

/// Poll the pool status until `check` holds, for up to five minutes of
/// (possibly paused) time.
pub async fn wait_for_status(pool: &SessionPool, mut check: impl FnMut(&PoolStatus) -> bool) -> bool {
    for _ in 0..3000 {
        if check(&pool.status().await) {
            return true;
        }
        tokio::time::sleep(POLL).await;
    }
    false
}

/// Poll `condition` until it holds, with the same limit.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..3000 {
        if condition() {
            return true;
        }
        tokio::time::sleep(POLL).await;
    }
    false
}

/// Router over a ready pool of `size` completing sessions.
pub async fn test_app(size: usize) -> (Router, SessionPool) {
    let launcher = Arc::new(FakeLauncher::completing());
    let pool = start_pool(test_config(size), launcher).await;
    (create_router(AppState::new(pool.clone())), pool)
}
