//! Completion detection for an unstructured output stream.
//!
//! The assistant never says "done". Completion is inferred by an ordered
//! policy, first match wins:
//! 1. explicit marker line
//! 2. every domain pattern seen in order, followed by a short quiet window
//! 3. a long quiet window (reported as possibly incomplete)
//! 4. the task's own deadline (failure)
//!
//! The detector is pure: it is fed output chunks and asked for a verdict at a
//! caller-supplied instant, so it can be tested without processes or clocks.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// ============================================================================
// Configuration
// ============================================================================

/// Completion policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Completion token; a line consisting of it ends the task.
    pub marker: Option<String>,
    /// Appended to every prompt. `{marker}` is replaced with the marker.
    pub marker_instruction: Option<String>,
    /// Regexes that must all appear, in order, for domain completion.
    pub domain_patterns: Vec<String>,
    /// Quiet window required after the last domain pattern (ms).
    pub domain_idle_ms: u64,
    /// Quiet window after which a task counts as done (ms).
    pub idle_complete_ms: u64,
    /// Periodic evaluation tick while busy (ms).
    pub poll_interval_ms: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            marker: Some("TASK COMPLETE".to_string()),
            marker_instruction: None,
            domain_patterns: vec![
                r"(?i)git commit|committed|files? changed".to_string(),
                r"(?i)git push|pushed|branch.*->".to_string(),
            ],
            domain_idle_ms: 10_000,
            idle_complete_ms: 60_000,
            poll_interval_ms: 1_000,
        }
    }
}

impl CompletionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

// ============================================================================
// Verdicts
// ============================================================================

/// Which rule declared a task finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionKind {
    Marker,
    Domain,
    Idle,
}

impl std::fmt::Display for CompletionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Marker => write!(f, "marker"),
            Self::Domain => write!(f, "domain"),
            Self::Idle => write!(f, "idle"),
        }
    }
}

/// Result of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep waiting.
    Pending,
    /// The task is finished.
    Complete {
        kind: CompletionKind,
        possibly_incomplete: bool,
    },
    /// The task's deadline passed first.
    TimedOut,
}

/// Timing inputs for an evaluation.
#[derive(Debug, Clone, Copy)]
pub struct TaskClock {
    pub now: Instant,
    pub last_activity: Instant,
    pub deadline: Option<Instant>,
}

impl TaskClock {
    fn silence(&self) -> Duration {
        self.now.saturating_duration_since(self.last_activity)
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Compiled, shareable completion policy.
#[derive(Debug)]
pub struct CompletionPolicy {
    marker: Option<String>,
    marker_instruction: Option<String>,
    domain: Vec<Regex>,
    domain_idle: Duration,
    idle_complete: Duration,
}

impl CompletionPolicy {
    pub fn from_config(config: &CompletionConfig) -> Result<Self, regex::Error> {
        let domain = config
            .domain_patterns
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        let marker = config
            .marker
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string);

        Ok(Self {
            marker,
            marker_instruction: config.marker_instruction.clone(),
            domain,
            domain_idle: Duration::from_millis(config.domain_idle_ms),
            idle_complete: Duration::from_millis(config.idle_complete_ms),
        })
    }

    /// Append the marker instruction, if configured.
    pub fn decorate_prompt(&self, prompt: &str) -> String {
        match (&self.marker_instruction, &self.marker) {
            (Some(instruction), marker) => {
                let instruction = instruction.replace("{marker}", marker.as_deref().unwrap_or(""));
                format!("{prompt}\n\n{instruction}")
            }
            (None, _) => prompt.to_string(),
        }
    }

    fn is_marker_line(&self, line: &str) -> bool {
        let Some(ref marker) = self.marker else {
            return false;
        };
        let decoration = |c: char| !c.is_alphanumeric();
        line.trim_matches(decoration) == marker.trim_matches(decoration)
    }
}

// ============================================================================
// Detector
// ============================================================================

/// Per-task detector state. Owns the task's output buffer.
#[derive(Debug)]
pub struct CompletionDetector {
    policy: Arc<CompletionPolicy>,
    output: String,
    /// Start of the line not yet terminated by a newline.
    line_start: usize,
    marker_seen: bool,
    /// Number of domain patterns matched so far.
    domain_stage: usize,
    /// Where the search for the next domain pattern resumes.
    domain_cursor: usize,
}

impl CompletionDetector {
    pub fn new(policy: Arc<CompletionPolicy>) -> Self {
        Self {
            policy,
            output: String::new(),
            line_start: 0,
            marker_seen: false,
            domain_stage: 0,
            domain_cursor: 0,
        }
    }

    /// Append cleaned output and update the marker and domain state.
    pub fn observe(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.output.push_str(chunk);

        while let Some(offset) = self.output[self.line_start..].find('\n') {
            let end = self.line_start + offset;
            if !self.marker_seen && self.policy.is_marker_line(&self.output[self.line_start..end]) {
                self.marker_seen = true;
            }
            self.line_start = end + 1;
        }
        if !self.marker_seen && self.policy.is_marker_line(&self.output[self.line_start..]) {
            self.marker_seen = true;
        }

        while let Some(pattern) = self.policy.domain.get(self.domain_stage) {
            match pattern.find(&self.output[self.domain_cursor..]) {
                Some(found) => {
                    self.domain_cursor += found.end();
                    self.domain_stage += 1;
                }
                None => break,
            }
        }
    }

    pub fn marker_seen(&self) -> bool {
        self.marker_seen
    }

    /// True once every domain pattern has been seen in order.
    pub fn domain_satisfied(&self) -> bool {
        !self.policy.domain.is_empty() && self.domain_stage == self.policy.domain.len()
    }

    pub fn into_output(self) -> String {
        self.output
    }

    /// Apply the policy at `clock.now`.
    pub fn evaluate(&self, clock: TaskClock) -> Verdict {
        if self.marker_seen() {
            return Verdict::Complete {
                kind: CompletionKind::Marker,
                possibly_incomplete: false,
            };
        }

        let silence = clock.silence();
        if self.domain_satisfied() && silence >= self.policy.domain_idle {
            return Verdict::Complete {
                kind: CompletionKind::Domain,
                possibly_incomplete: false,
            };
        }

        if silence >= self.policy.idle_complete {
            return Verdict::Complete {
                kind: CompletionKind::Idle,
                possibly_incomplete: true,
            };
        }

        match clock.deadline {
            Some(deadline) if clock.now >= deadline => Verdict::TimedOut,
            _ => Verdict::Pending,
        }
    }
}
