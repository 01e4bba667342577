//! Deployment attempt: one artifact rolling out to one stage.
//!
//! Every transition is guarded: an attempt only moves forward along the
//! state machine, and terminal states never change again.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use stagecraft_core::ArtifactReference;

/// Status of a deployment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Created, gate not yet evaluated.
    Pending,
    /// Suspended until an approval for this stage arrives.
    AwaitingApproval,
    /// Artifact is rolling out and being observed.
    InProgress,
    /// Rollout passed its health checks.
    Healthy,
    /// Rollout failed and the stage was reverted to its previous artifact.
    RolledBack,
    /// Rollout failed and could not be reverted.
    Failed,
}

impl AttemptStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptStatus::Healthy | AttemptStatus::RolledBack | AttemptStatus::Failed
        )
    }
}

/// Rejected state transition.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("stage {stage}: cannot {action} from {from:?}")]
pub struct TransitionError {
    pub stage: String,
    pub action: &'static str,
    pub from: AttemptStatus,
}

/// Rollout of one artifact to one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentAttempt {
    pub stage: String,
    pub status: AttemptStatus,
    /// The artifact this attempt rolls out.
    pub artifact: ArtifactReference,
    /// What is actually serving on the stage right now, if known.
    pub running_artifact: Option<ArtifactReference>,
    /// Rollback target: the last artifact that reached `Healthy` on this stage.
    pub previous_healthy_artifact: Option<ArtifactReference>,
    pub rollback_attempted: bool,
    /// Unix timestamp when the attempt entered `AwaitingApproval`.
    pub awaiting_since: Option<u64>,
    pub failure_reason: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl DeploymentAttempt {
    /// Create a pending attempt. `previous_healthy` is the stage's last
    /// known-good artifact, which is also what is running before rollout.
    pub fn new(
        stage: &str,
        artifact: ArtifactReference,
        previous_healthy: Option<ArtifactReference>,
        now: u64,
    ) -> Self {
        Self {
            stage: stage.to_string(),
            status: AttemptStatus::Pending,
            artifact,
            running_artifact: previous_healthy.clone(),
            previous_healthy_artifact: previous_healthy,
            rollback_attempted: false,
            awaiting_since: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn reject(&self, action: &'static str) -> TransitionError {
        TransitionError {
            stage: self.stage.clone(),
            action,
            from: self.status,
        }
    }

    /// Pending → AwaitingApproval.
    pub fn await_approval(&mut self, now: u64) -> Result<(), TransitionError> {
        if self.status != AttemptStatus::Pending {
            return Err(self.reject("await approval"));
        }
        self.status = AttemptStatus::AwaitingApproval;
        self.awaiting_since = Some(now);
        self.updated_at = now;
        info!(stage = %self.stage, digest = %self.artifact.content_digest, "awaiting approval");
        Ok(())
    }

    /// Pending | AwaitingApproval → InProgress.
    pub fn begin_rollout(&mut self, now: u64) -> Result<(), TransitionError> {
        if !matches!(
            self.status,
            AttemptStatus::Pending | AttemptStatus::AwaitingApproval
        ) {
            return Err(self.reject("begin rollout"));
        }
        self.status = AttemptStatus::InProgress;
        self.running_artifact = Some(self.artifact.clone());
        self.updated_at = now;
        info!(stage = %self.stage, digest = %self.artifact.content_digest, "rollout started");
        Ok(())
    }

    /// InProgress → Healthy. The rolled-out artifact becomes the new
    /// rollback target.
    pub fn mark_healthy(&mut self, now: u64) -> Result<(), TransitionError> {
        if self.status != AttemptStatus::InProgress {
            return Err(self.reject("mark healthy"));
        }
        self.status = AttemptStatus::Healthy;
        self.previous_healthy_artifact = Some(self.artifact.clone());
        self.updated_at = now;
        info!(stage = %self.stage, digest = %self.artifact.content_digest, "stage healthy");
        Ok(())
    }

    /// Trip the breaker on an in-flight rollout.
    ///
    /// Returns the artifact to revert to. When there is none the attempt
    /// is marked `Failed` and `None` is returned. A second trip is rejected.
    pub fn trip(&mut self, now: u64) -> Result<Option<ArtifactReference>, TransitionError> {
        if self.status != AttemptStatus::InProgress || self.rollback_attempted {
            return Err(self.reject("roll back"));
        }
        self.rollback_attempted = true;
        self.updated_at = now;

        match self.previous_healthy_artifact.clone() {
            Some(target) => {
                warn!(
                    stage = %self.stage,
                    from = %self.artifact.content_digest,
                    to = %target.content_digest,
                    "rolling back to last healthy artifact"
                );
                Ok(Some(target))
            }
            None => {
                self.status = AttemptStatus::Failed;
                self.failure_reason = Some(format!(
                    "rollback exhausted: no previous healthy artifact for stage {}",
                    self.stage
                ));
                warn!(stage = %self.stage, "unhealthy on first deploy, nothing to roll back to");
                Ok(None)
            }
        }
    }

    /// Record a completed revert: the previous artifact is running again.
    pub fn complete_rollback(&mut self, now: u64) -> Result<(), TransitionError> {
        if self.status != AttemptStatus::InProgress || !self.rollback_attempted {
            return Err(self.reject("complete rollback"));
        }
        self.status = AttemptStatus::RolledBack;
        self.running_artifact = self.previous_healthy_artifact.clone();
        self.failure_reason = Some(format!(
            "rolled back {} after failed health checks",
            self.artifact.content_digest
        ));
        self.updated_at = now;
        Ok(())
    }

    /// Any non-terminal status → Failed.
    pub fn fail(&mut self, reason: impl Into<String>, now: u64) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(self.reject("fail"));
        }
        let reason = reason.into();
        warn!(stage = %self.stage, %reason, "deployment attempt failed");
        self.status = AttemptStatus::Failed;
        self.failure_reason = Some(reason);
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use stagecraft_core::ContentDigest;

    pub(crate) fn artifact(digest: &str) -> ArtifactReference {
        ArtifactReference::new("registry/app", ContentDigest::parse(digest).unwrap())
    }

    #[test]
    fn happy_path_records_previous_healthy() {
        let mut attempt = DeploymentAttempt::new("dev", artifact("sha256:b"), None, 1);
        attempt.begin_rollout(2).unwrap();
        assert_eq!(attempt.running_artifact, Some(artifact("sha256:b")));

        attempt.mark_healthy(3).unwrap();
        assert_eq!(attempt.status, AttemptStatus::Healthy);
        assert_eq!(attempt.previous_healthy_artifact, Some(artifact("sha256:b")));
    }

    #[test]
    fn approval_path() {
        let mut attempt = DeploymentAttempt::new("prod", artifact("sha256:b"), None, 1);
        attempt.await_approval(5).unwrap();
        assert_eq!(attempt.awaiting_since, Some(5));
        attempt.begin_rollout(6).unwrap();
        assert_eq!(attempt.status, AttemptStatus::InProgress);
    }

    #[test]
    fn rollback_reverts_running_artifact() {
        let mut attempt =
            DeploymentAttempt::new("prod", artifact("sha256:b"), Some(artifact("sha256:a")), 1);
        attempt.begin_rollout(2).unwrap();

        let target = attempt.trip(3).unwrap();
        assert_eq!(target, Some(artifact("sha256:a")));
        attempt.complete_rollback(4).unwrap();

        assert_eq!(attempt.status, AttemptStatus::RolledBack);
        assert_eq!(attempt.running_artifact, Some(artifact("sha256:a")));
        // A rolled-back attempt does not promote the bad artifact.
        assert_eq!(attempt.previous_healthy_artifact, Some(artifact("sha256:a")));
    }

    #[test]
    fn first_deploy_trip_fails() {
        let mut attempt = DeploymentAttempt::new("prod", artifact("sha256:b"), None, 1);
        attempt.begin_rollout(2).unwrap();
        assert_eq!(attempt.trip(3).unwrap(), None);
        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert!(attempt.failure_reason.as_deref().unwrap().contains("rollback exhausted"));
    }

    #[test]
    fn rollback_only_once() {
        let mut attempt =
            DeploymentAttempt::new("prod", artifact("sha256:b"), Some(artifact("sha256:a")), 1);
        attempt.begin_rollout(2).unwrap();
        attempt.trip(3).unwrap();
        assert!(attempt.trip(4).is_err());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut attempt = DeploymentAttempt::new("dev", artifact("sha256:b"), None, 1);
        attempt.begin_rollout(2).unwrap();
        attempt.mark_healthy(3).unwrap();

        assert!(attempt.fail("late", 4).is_err());
        assert!(attempt.begin_rollout(4).is_err());
        assert!(attempt.await_approval(4).is_err());
    }

    #[test]
    fn cannot_skip_rollout() {
        let mut attempt = DeploymentAttempt::new("dev", artifact("sha256:b"), None, 1);
        let err = attempt.mark_healthy(2).unwrap_err();
        assert_eq!(err.from, AttemptStatus::Pending);
    }

    #[test]
    fn serializes_status_snake_case() {
        let json = serde_json::to_string(&AttemptStatus::AwaitingApproval).unwrap();
        assert_eq!(json, "\"awaiting_approval\"");
    }
}
