//! Probe timing and thresholds.

use std::time::Duration;

use stagecraft_core::config::{HealthSection, duration_or};

/// Resolved health-check parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSettings {
    /// Delay between probes.
    pub interval: Duration,
    /// Per-probe timeout.
    pub timeout: Duration,
    /// Consecutive successes before a stage is declared healthy.
    pub healthy_threshold: u32,
    /// Consecutive failures before a stage is declared unhealthy.
    pub unhealthy_threshold: u32,
    /// Longest a rollout may stay undecided before it counts as unhealthy.
    pub rollout_deadline: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(5),
            healthy_threshold: 3,
            unhealthy_threshold: 2,
            rollout_deadline: Duration::from_secs(15 * 60),
        }
    }
}

impl HealthSettings {
    pub fn from_section(section: Option<&HealthSection>) -> Self {
        let defaults = Self::default();
        let Some(s) = section else {
            return defaults;
        };
        Self {
            interval: duration_or(s.interval.as_deref(), defaults.interval),
            timeout: duration_or(s.timeout.as_deref(), defaults.timeout),
            healthy_threshold: s.healthy_threshold.unwrap_or(defaults.healthy_threshold).max(1),
            unhealthy_threshold: s
                .unhealthy_threshold
                .unwrap_or(defaults.unhealthy_threshold)
                .max(1),
            rollout_deadline: duration_or(s.rollout_deadline.as_deref(), defaults.rollout_deadline),
        }
    }
}
