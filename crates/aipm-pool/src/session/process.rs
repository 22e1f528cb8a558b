//! Assistant process plumbing.
//!
//! A launched process is reduced to three channels: an input queue drained
//! into stdin by a writer task, a stream of [`ProcessEvent`]s (output chunks,
//! then exactly one exit) and a control channel accepting [`ProcessSignal`]s.
//! Dropping the control channel kills the process.
//!
//! Writes never block the caller. A process that stops reading its stdin
//! only stalls its own writer task.

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, trace, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{SessionConfig, SessionId};

/// Capacity of the per-process event channel.
const EVENT_BUFFER: usize = 256;

/// How long the reaper waits for stdout to drain after the process exits.
/// Grandchildren can keep the pipe open indefinitely.
const READER_DRAIN: Duration = Duration::from_millis(500);

// ============================================================================
// Events and signals
// ============================================================================

/// Something observed on a running process.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// A chunk of stdout, decoded as UTF-8. Not line aligned.
    Output(String),
    /// The process ended. Always the last event.
    Exited(ExitInfo),
}

/// Control requests for a running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Ask the process to stop (SIGTERM).
    Terminate,
    /// Stop the process unconditionally (SIGKILL).
    Kill,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {}", code),
            (None, Some(sig)) => {
                let sig_name = match sig {
                    2 => "SIGINT",
                    9 => "SIGKILL",
                    15 => "SIGTERM",
                    11 => "SIGSEGV",
                    6 => "SIGABRT",
                    _ => "",
                };
                if sig_name.is_empty() {
                    write!(f, "killed by signal {}", sig)
                } else {
                    write!(f, "killed by {} (signal {})", sig_name, sig)
                }
            }
            (None, None) => write!(f, "exited (unknown status)"),
        }
    }
}

// ============================================================================
// Launched process
// ============================================================================

/// Handles to one running assistant process.
pub struct LaunchedProcess {
    /// OS process id, when there is one.
    pub pid: Option<u32>,
    /// Output chunks followed by a single exit event.
    pub events: mpsc::Receiver<ProcessEvent>,
    /// Control channel; dropping it kills the process.
    pub signals: mpsc::UnboundedSender<ProcessSignal>,
    input: mpsc::UnboundedSender<Vec<u8>>,
}

impl LaunchedProcess {
    /// Wrap a started process, spawning the writer task that owns `stdin`.
    pub fn new<W>(
        session: SessionId,
        pid: Option<u32>,
        stdin: W,
        events: mpsc::Receiver<ProcessEvent>,
        signals: mpsc::UnboundedSender<ProcessSignal>,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (input, input_rx) = mpsc::unbounded_channel();
        tokio::spawn(stdin_writer(session, stdin, input_rx));
        Self {
            pid,
            events,
            signals,
            input,
        }
    }

    /// Queue `text` followed by `line_ending` for the process.
    ///
    /// Fails once the writer has stopped (the pipe broke).
    pub fn send_line(&self, text: &str, line_ending: &str) -> std::io::Result<()> {
        let mut bytes = Vec::with_capacity(text.len() + line_ending.len());
        bytes.extend_from_slice(text.as_bytes());
        bytes.extend_from_slice(line_ending.as_bytes());
        self.send_raw(&bytes)
    }

    /// Queue raw bytes (control characters) for the process.
    pub fn send_raw(&self, bytes: &[u8]) -> std::io::Result<()> {
        self.input.send(bytes.to_vec()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "process input is closed")
        })
    }

    /// Deliver a control signal. Returns false once the process is gone.
    pub fn signal(&self, signal: ProcessSignal) -> bool {
        self.signals.send(signal).is_ok()
    }
}

impl fmt::Debug for LaunchedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchedProcess")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Starts assistant processes for sessions.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Launch a fresh process for `session`.
    ///
    /// Readiness is judged by the caller from the event stream; this only
    /// has to get the process running.
    async fn launch(&self, session: SessionId) -> Result<LaunchedProcess>;
}

// ============================================================================
// OS process launcher
// ============================================================================

/// Launches the configured command with piped stdio.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    config: SessionConfig,
}

impl CommandLauncher {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn launch(&self, session: SessionId) -> Result<LaunchedProcess> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = self.config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", self.config.command))?;
        let pid = child.id();

        let stdin = child.stdin.take().context("Failed to get stdin")?;
        let stdout = child.stdout.take().context("Failed to get stdout")?;
        let stderr = child.stderr.take().context("Failed to get stderr")?;

        debug!(
            "Session {} spawned '{}' (pid {:?})",
            session, self.config.command, pid
        );

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_stdout(session, stdout, events_tx.clone()));
        tokio::spawn(read_stderr(session, stderr));
        tokio::spawn(reap(session, child, signals_rx, reader, events_tx));

        Ok(LaunchedProcess::new(session, pid, stdin, events_rx, signals_tx))
    }
}

/// Drain queued input into the process until the queue closes or a write fails.
async fn stdin_writer<W>(
    session: SessionId,
    mut stdin: W,
    mut input: mpsc::UnboundedReceiver<Vec<u8>>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = input.recv().await {
        trace!("Session {} writing {} bytes to stdin", session, bytes.len());
        if let Err(e) = stdin.write_all(&bytes).await {
            debug!("Session {} stdin write failed: {}", session, e);
            break;
        }
        if let Err(e) = stdin.flush().await {
            debug!("Session {} stdin flush failed: {}", session, e);
            break;
        }
    }
    debug!("Session {} stdin writer ended", session);
}

async fn read_stdout(
    session: SessionId,
    mut stdout: ChildStdout,
    events: mpsc::Sender<ProcessEvent>,
) {
    let mut buf = [0u8; 8192];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let text = take_utf8_prefix(&mut pending);
                if !text.is_empty() && events.send(ProcessEvent::Output(text)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("Session {} stdout read error: {}", session, e);
                break;
            }
        }
    }

    if !pending.is_empty() {
        let text = String::from_utf8_lossy(&pending).into_owned();
        let _ = events.send(ProcessEvent::Output(text)).await;
    }
}

async fn read_stderr(session: SessionId, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        trace!("[session {}] stderr: {}", session, line);
    }
}

/// Own the child until it exits, applying control signals as they arrive.
async fn reap(
    session: SessionId,
    mut child: Child,
    mut signals: mpsc::UnboundedReceiver<ProcessSignal>,
    reader: JoinHandle<()>,
    events: mpsc::Sender<ProcessEvent>,
) {
    let pid = child.id();
    let mut signals_open = true;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            signal = signals.recv(), if signals_open => match signal {
                Some(ProcessSignal::Terminate) => send_terminate(&mut child, pid),
                Some(ProcessSignal::Kill) => {
                    if let Err(e) = child.start_kill() {
                        debug!("Session {} kill failed: {}", session, e);
                    }
                }
                None => {
                    signals_open = false;
                    let _ = child.start_kill();
                }
            }
        }
    };

    let info = match status {
        Ok(status) => ExitInfo::from_status(status),
        Err(e) => {
            warn!("Error waiting for session {} process: {:?}", session, e);
            ExitInfo::default()
        }
    };

    if tokio::time::timeout(READER_DRAIN, reader).await.is_err() {
        debug!("Session {} stdout still open after exit", session);
    }
    let _ = events.send(ProcessEvent::Exited(info)).await;
}

#[cfg(unix)]
fn send_terminate(_child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid {
        // SAFETY: plain kill(2) on a pid we spawned and have not yet reaped.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

/// Split off the longest valid UTF-8 prefix, keeping an incomplete trailing
/// sequence for the next read.
fn take_utf8_prefix(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let rest = pending.split_off(e.valid_up_to());
            let text = String::from_utf8_lossy(pending).into_owned();
            *pending = rest;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}
