//! Approval gates.

use std::time::Duration;

use thiserror::Error;

use stagecraft_core::StageDescriptor;

pub const APPROVAL_REQUIRED: &str = "manual approval required";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    Suspend(String),
}

/// Production-sensitive stages always suspend; everything else proceeds.
pub fn evaluate(stage: &StageDescriptor) -> GateDecision {
    if stage.production {
        GateDecision::Suspend(APPROVAL_REQUIRED.to_string())
    } else {
        GateDecision::Proceed
    }
}

/// A stage waited longer for approval than the policy allows.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("approval for stage {stage} expired after {waited_secs}s")]
pub struct GateTimeout {
    pub stage: String,
    pub waited_secs: u64,
}

/// How long a suspended stage may wait. `None` waits forever.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApprovalPolicy {
    pub expires_after: Option<Duration>,
}

impl ApprovalPolicy {
    pub fn expiring_after(limit: Duration) -> Self {
        Self {
            expires_after: Some(limit),
        }
    }

    /// Check a wait that started at `awaiting_since` (Unix seconds).
    pub fn check(&self, stage: &str, awaiting_since: u64, now: u64) -> Result<(), GateTimeout> {
        let Some(limit) = self.expires_after else {
            return Ok(());
        };
        let waited_secs = now.saturating_sub(awaiting_since);
        if waited_secs >= limit.as_secs() {
            return Err(GateTimeout {
                stage: stage.to_string(),
                waited_secs,
            });
        }
        Ok(())
    }
}
