//! Deployment circuit breaker.
//!
//! Feeds health verdicts into an in-flight attempt and tells the caller
//! what to do next. The breaker never reverts on its own; it hands back a
//! `Revert` action and the caller reports how the revert went.

use tracing::debug;

use stagecraft_core::{ArtifactReference, HealthVerdict};

use crate::attempt::{AttemptStatus, DeploymentAttempt, TransitionError};

/// What the caller should do after a verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerAction {
    /// Keep observing.
    Continue,
    /// Rollout is healthy; the attempt is now `Healthy`.
    Promote,
    /// Redeploy this artifact, then call [`CircuitBreaker::revert_finished`].
    Revert { to: ArtifactReference },
    /// Nothing to revert to; the attempt is now `Failed`.
    Exhausted,
}

/// Stateless rules for the rollout circuit breaker.
pub struct CircuitBreaker;

impl CircuitBreaker {
    /// Apply a health verdict to an `InProgress` attempt.
    pub fn on_verdict(
        attempt: &mut DeploymentAttempt,
        verdict: HealthVerdict,
        now: u64,
    ) -> Result<BreakerAction, TransitionError> {
        if attempt.status != AttemptStatus::InProgress {
            return Err(TransitionError {
                stage: attempt.stage.clone(),
                action: "observe",
                from: attempt.status,
            });
        }

        match verdict {
            HealthVerdict::Degraded => {
                debug!(stage = %attempt.stage, "rollout still settling");
                Ok(BreakerAction::Continue)
            }
            HealthVerdict::Healthy => {
                attempt.mark_healthy(now)?;
                Ok(BreakerAction::Promote)
            }
            HealthVerdict::Unhealthy => match attempt.trip(now)? {
                Some(to) => Ok(BreakerAction::Revert { to }),
                None => Ok(BreakerAction::Exhausted),
            },
        }
    }

    /// Record the outcome of a revert requested by `BreakerAction::Revert`.
    pub fn revert_finished(
        attempt: &mut DeploymentAttempt,
        outcome: Result<(), String>,
        now: u64,
    ) -> Result<(), TransitionError> {
        match outcome {
            Ok(()) => attempt.complete_rollback(now),
            Err(e) => attempt.fail(format!("rollback failed: {e}"), now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::tests::artifact;

    fn in_flight(previous: Option<&str>) -> DeploymentAttempt {
        let mut attempt =
            DeploymentAttempt::new("prod", artifact("sha256:b"), previous.map(artifact), 1);
        attempt.begin_rollout(2).unwrap();
        attempt
    }

    #[test]
    fn degraded_keeps_observing() {
        let mut attempt = in_flight(None);
        let action = CircuitBreaker::on_verdict(&mut attempt, HealthVerdict::Degraded, 3).unwrap();
        assert_eq!(action, BreakerAction::Continue);
        assert_eq!(attempt.status, AttemptStatus::InProgress);
    }

    #[test]
    fn healthy_promotes() {
        let mut attempt = in_flight(Some("sha256:a"));
        let action = CircuitBreaker::on_verdict(&mut attempt, HealthVerdict::Healthy, 3).unwrap();
        assert_eq!(action, BreakerAction::Promote);
        assert_eq!(attempt.previous_healthy_artifact, Some(artifact("sha256:b")));
    }

    #[test]
    fn unhealthy_with_previous_reverts() {
        let mut attempt = in_flight(Some("sha256:a"));
        let action = CircuitBreaker::on_verdict(&mut attempt, HealthVerdict::Unhealthy, 3).unwrap();
        assert_eq!(action, BreakerAction::Revert { to: artifact("sha256:a") });

        CircuitBreaker::revert_finished(&mut attempt, Ok(()), 4).unwrap();
        assert_eq!(attempt.status, AttemptStatus::RolledBack);
        assert_eq!(attempt.running_artifact, Some(artifact("sha256:a")));
    }

    #[test]
    fn unhealthy_without_previous_is_exhausted() {
        let mut attempt = in_flight(None);
        let action = CircuitBreaker::on_verdict(&mut attempt, HealthVerdict::Unhealthy, 3).unwrap();
        assert_eq!(action, BreakerAction::Exhausted);
        assert_eq!(attempt.status, AttemptStatus::Failed);
    }

    #[test]
    fn failed_revert_fails_attempt() {
        let mut attempt = in_flight(Some("sha256:a"));
        CircuitBreaker::on_verdict(&mut attempt, HealthVerdict::Unhealthy, 3).unwrap();
        CircuitBreaker::revert_finished(&mut attempt, Err("registry down".into()), 4).unwrap();
        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert!(attempt.failure_reason.unwrap().contains("registry down"));
    }

    #[test]
    fn verdict_after_terminal_is_rejected() {
        let mut attempt = in_flight(None);
        CircuitBreaker::on_verdict(&mut attempt, HealthVerdict::Healthy, 3).unwrap();
        assert!(CircuitBreaker::on_verdict(&mut attempt, HealthVerdict::Unhealthy, 4).is_err());
    }
}
