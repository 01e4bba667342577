//! stagecraft-rollout — per-stage deployment attempts.
//!
//! A `DeploymentAttempt` tracks one artifact rolling out to one stage:
//!
//! ```text
//! Pending ──> [AwaitingApproval] ──> InProgress ──> Healthy
//!                                        │
//!                                        ├──> RolledBack   (reverted to last known-good)
//!                                        └──> Failed       (nothing to revert to)
//! ```
//!
//! # Components
//!
//! - **`attempt`**: the attempt record and its guarded transitions
//! - **`breaker`**: deployment circuit breaker driven by health verdicts

pub mod attempt;
pub mod breaker;

pub use attempt::{AttemptStatus, DeploymentAttempt, TransitionError};
pub use breaker::{BreakerAction, CircuitBreaker};
