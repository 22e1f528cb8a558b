//! Abnormality scoring for busy sessions.
//!
//! A hung assistant can still print the odd line, so it may never reach the
//! idle-based completion paths. Each monitor tick scores every busy session
//! from independent signals; each signal contributes either nothing or its
//! full weight. A total at or above the threshold marks the session stuck.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resources::ResourceSample;

/// Scores within this distance of the threshold count as reaching it.
const SCORE_EPSILON: f64 = 1e-9;

// ============================================================================
// Configuration
// ============================================================================

/// Weights and trigger levels of the abnormality detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbnormalityConfig {
    /// Run the monitor loop at all.
    pub enabled: bool,
    /// Monitor tick (ms).
    pub interval_ms: u64,
    /// Restart when the summed score reaches this value.
    pub threshold: f64,
    pub no_output: DurationSignal,
    pub low_cpu: LevelSignal,
    pub high_memory: LevelSignal,
    pub long_runtime: DurationSignal,
}

impl Default for AbnormalityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
            threshold: 0.5,
            no_output: DurationSignal {
                weight: 0.4,
                after_ms: 30_000,
            },
            low_cpu: LevelSignal {
                weight: 0.3,
                level: 1.0,
            },
            high_memory: LevelSignal {
                weight: 0.2,
                level: 500.0,
            },
            long_runtime: DurationSignal {
                weight: 0.1,
                after_ms: 600_000,
            },
        }
    }
}

impl AbnormalityConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Signal that fires once a duration is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DurationSignal {
    pub weight: f64,
    pub after_ms: u64,
}

impl DurationSignal {
    fn fires(&self, observed: Duration) -> bool {
        observed > Duration::from_millis(self.after_ms)
    }
}

/// Signal compared against a level: CPU percent for `low_cpu`, megabytes
/// of resident memory for `high_memory`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelSignal {
    pub weight: f64,
    pub level: f64,
}

// ============================================================================
// Scoring
// ============================================================================

/// Individual signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    NoOutput,
    LowCpu,
    HighMemory,
    LongRuntime,
}

/// Observations about one busy session at one instant.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionSignals {
    /// Time since the last output.
    pub silence: Duration,
    /// Time since the bound task started.
    pub task_runtime: Duration,
    /// Latest resource sample, when one could be taken.
    pub resources: Option<ResourceSample>,
}

/// Weighted score and the signals that produced it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AbnormalityScore {
    pub total: f64,
    pub fired: Vec<Signal>,
}

impl std::fmt::Display for AbnormalityScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2} {:?}", self.total, self.fired)
    }
}

/// Stateless scorer.
#[derive(Debug, Clone)]
pub struct AbnormalityDetector {
    config: AbnormalityConfig,
}

impl AbnormalityDetector {
    pub fn new(config: AbnormalityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AbnormalityConfig {
        &self.config
    }

    pub fn score(&self, signals: &SessionSignals) -> AbnormalityScore {
        let cfg = &self.config;
        let mut score = AbnormalityScore::default();
        let mut fire = |signal: Signal, weight: f64| {
            score.total += weight;
            score.fired.push(signal);
        };

        if cfg.no_output.fires(signals.silence) {
            fire(Signal::NoOutput, cfg.no_output.weight);
        }
        if let Some(sample) = signals.resources {
            // Unknown CPU (first sample of a process) never counts as low.
            if sample.cpu_percent.is_some_and(|cpu| cpu < cfg.low_cpu.level) {
                fire(Signal::LowCpu, cfg.low_cpu.weight);
            }
            if sample.rss_mb() > cfg.high_memory.level {
                fire(Signal::HighMemory, cfg.high_memory.weight);
            }
        }
        if cfg.long_runtime.fires(signals.task_runtime) {
            fire(Signal::LongRuntime, cfg.long_runtime.weight);
        }

        score
    }

    pub fn is_abnormal(&self, score: &AbnormalityScore) -> bool {
        score.total + SCORE_EPSILON >= self.config.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> AbnormalityDetector {
        AbnormalityDetector::new(AbnormalityConfig::default())
    }

    fn sample(cpu: Option<f64>, rss_mb: u64) -> Option<ResourceSample> {
        Some(ResourceSample {
            cpu_percent: cpu,
            rss_bytes: rss_mb * 1024 * 1024,
        })
    }

    #[test]
    fn test_silent_and_idle_cpu_is_abnormal() {
        let det = detector();
        let signals = SessionSignals {
            silence: Duration::from_secs(31),
            task_runtime: Duration::from_secs(45),
            resources: sample(Some(0.0), 120),
        };
        let score = det.score(&signals);
        assert!((score.total - 0.7).abs() < 1e-9);
        assert_eq!(score.fired, vec![Signal::NoOutput, Signal::LowCpu]);
        assert!(det.is_abnormal(&score));
    }

    #[test]
    fn test_silence_alone_is_not_enough() {
        let det = detector();
        let signals = SessionSignals {
            silence: Duration::from_secs(31),
            task_runtime: Duration::from_secs(45),
            resources: sample(Some(12.5), 120),
        };
        let score = det.score(&signals);
        assert!((score.total - 0.4).abs() < 1e-9);
        assert!(!det.is_abnormal(&score));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let det = detector();
        // 0.4 + 0.1 lands exactly on the 0.5 threshold.
        let signals = SessionSignals {
            silence: Duration::from_secs(120),
            task_runtime: Duration::from_secs(601),
            resources: None,
        };
        let score = det.score(&signals);
        assert_eq!(score.fired, vec![Signal::NoOutput, Signal::LongRuntime]);
        assert!(det.is_abnormal(&score));
    }

    #[test]
    fn test_boundaries_are_exclusive() {
        let det = detector();
        let signals = SessionSignals {
            silence: Duration::from_secs(30),
            task_runtime: Duration::from_secs(600),
            resources: sample(Some(1.0), 500),
        };
        let score = det.score(&signals);
        assert!(score.fired.is_empty());
        assert_eq!(score.total, 0.0);
    }

    #[test]
    fn test_unknown_resources_contribute_nothing() {
        let det = detector();
        let signals = SessionSignals {
            silence: Duration::from_secs(5),
            task_runtime: Duration::from_secs(5),
            resources: sample(None, 900),
        };
        let score = det.score(&signals);
        assert_eq!(score.fired, vec![Signal::HighMemory]);
        assert!(!det.is_abnormal(&score));
    }

    #[test]
    fn test_weights_come_from_config() {
        let config = AbnormalityConfig {
            threshold: 0.3,
            no_output: DurationSignal {
                weight: 0.35,
                after_ms: 1_000,
            },
            ..AbnormalityConfig::default()
        };
        let det = AbnormalityDetector::new(config);
        let score = det.score(&SessionSignals {
            silence: Duration::from_secs(2),
            ..SessionSignals::default()
        });
        assert!(det.is_abnormal(&score));
    }
}
