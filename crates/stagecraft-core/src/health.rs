//! Health verdicts shared by the health monitor and the rollout breaker.

use serde::{Deserialize, Serialize};

/// Outcome of health observation for a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthVerdict {
    /// Enough consecutive successful probes.
    Healthy,
    /// Not yet decided either way.
    Degraded,
    /// Enough consecutive failed probes.
    Unhealthy,
}

impl HealthVerdict {
    /// Whether the verdict is final for a rollout.
    pub fn is_settled(&self) -> bool {
        !matches!(self, HealthVerdict::Degraded)
    }
}
