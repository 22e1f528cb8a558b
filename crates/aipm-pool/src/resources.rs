//! Per-process resource sampling.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::fs;

/// One resource observation of a process.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSample {
    /// CPU usage since the previous sample; `None` on the first sample.
    pub cpu_percent: Option<f64>,
    pub rss_bytes: u64,
}

impl ResourceSample {
    pub fn rss_mb(&self) -> f64 {
        self.rss_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Source of resource samples, injectable for tests.
#[async_trait]
pub trait ResourceSampler: Send + Sync {
    /// Sample `pid`, or `None` if it cannot be observed.
    async fn sample(&self, pid: u32) -> Option<ResourceSample>;

    /// Drop remembered state for processes not in `live`.
    fn retain(&self, _live: &[u32]) {}
}

/// Sampler that never has data; every resource signal stays quiet.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSampler;

#[async_trait]
impl ResourceSampler for NoopSampler {
    async fn sample(&self, _pid: u32) -> Option<ResourceSample> {
        None
    }
}

// ============================================================================
// procfs sampler
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct CpuReading {
    /// utime + stime in clock ticks.
    ticks: u64,
    at: Instant,
}

/// Reads `/proc/<pid>/stat` and `/proc/<pid>/status`.
#[derive(Debug)]
pub struct ProcSampler {
    previous: Mutex<HashMap<u32, CpuReading>>,
    ticks_per_sec: f64,
}

impl Default for ProcSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcSampler {
    pub fn new() -> Self {
        Self {
            previous: Mutex::new(HashMap::new()),
            ticks_per_sec: clock_ticks_per_sec(),
        }
    }

    async fn read(&self, pid: u32) -> Result<ResourceSample> {
        let stat = fs::read_to_string(format!("/proc/{pid}/stat"))
            .await
            .with_context(|| format!("reading /proc/{pid}/stat"))?;
        let status = fs::read_to_string(format!("/proc/{pid}/status"))
            .await
            .with_context(|| format!("reading /proc/{pid}/status"))?;

        let current = CpuReading {
            ticks: parse_stat_ticks(&stat)?,
            at: Instant::now(),
        };
        let rss_bytes = parse_status_rss(&status)?;

        let mut previous = self
            .previous
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let cpu_percent =
            compute_cpu_percent(previous.get(&pid), &current, self.ticks_per_sec);
        previous.insert(pid, current);

        Ok(ResourceSample {
            cpu_percent,
            rss_bytes,
        })
    }
}

#[async_trait]
impl ResourceSampler for ProcSampler {
    async fn sample(&self, pid: u32) -> Option<ResourceSample> {
        match self.read(pid).await {
            Ok(sample) => Some(sample),
            Err(e) => {
                log::debug!("resource sample for pid {} unavailable: {:#}", pid, e);
                None
            }
        }
    }

    fn retain(&self, live: &[u32]) {
        self.previous
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|pid, _| live.contains(pid));
    }
}

fn clock_ticks_per_sec() -> f64 {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions.
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if ticks > 0 {
            return ticks as f64;
        }
    }
    100.0
}

/// utime + stime from a `/proc/<pid>/stat` line.
///
/// The command name (field 2) may contain spaces and parentheses, so fields
/// are counted from the last closing parenthesis.
fn parse_stat_ticks(contents: &str) -> Result<u64> {
    let rest = contents
        .rfind(')')
        .map(|idx| &contents[idx + 1..])
        .context("malformed stat line")?;
    // rest starts at field 3 (state); utime and stime are fields 14 and 15.
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime = fields
        .get(11)
        .context("stat line missing utime")?
        .parse::<u64>()
        .context("parsing utime")?;
    let stime = fields
        .get(12)
        .context("stat line missing stime")?
        .parse::<u64>()
        .context("parsing stime")?;
    Ok(utime + stime)
}

fn parse_status_rss(contents: &str) -> Result<u64> {
    // Kernel threads and zombies have no VmRSS line.
    let Some(line) = contents.lines().find(|line| line.starts_with("VmRSS:")) else {
        return Ok(0);
    };
    let kb = line
        .split_whitespace()
        .nth(1)
        .context("VmRSS line missing value")?
        .parse::<u64>()
        .context("parsing VmRSS")?;
    Ok(kb.saturating_mul(1024))
}

fn compute_cpu_percent(
    prev: Option<&CpuReading>,
    current: &CpuReading,
    ticks_per_sec: f64,
) -> Option<f64> {
    let prev = prev?;
    let wall = current.at.saturating_duration_since(prev.at).as_secs_f64();
    if wall <= 0.0 {
        return None;
    }
    let cpu_secs = current.ticks.saturating_sub(prev.ticks) as f64 / ticks_per_sec;
    Some(cpu_secs / wall * 100.0)
}
