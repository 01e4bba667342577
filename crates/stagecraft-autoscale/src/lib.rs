//! stagecraft-autoscale — CPU target tracking for stage fleets.
//!
//! Each stage runs two fleets (compute instances and service tasks) that
//! scale independently against the same CPU target.
//!
//! # Scaling Algorithm
//!
//! ```text
//! ratio   = observed_cpu / target_cpu        (target defaults to 60%)
//!
//! if current outside [min, max]:
//!     clamp immediately, ignoring cooldowns
//! if |ratio - 1| <= 0.1:
//!     no change
//! desired = clamp(ceil(current * ratio), min, max)
//! if desired > current and scale-out cooldown elapsed: scale out
//! if desired < current and scale-in cooldown elapsed:  scale in
//! ```
//!
//! Cooldowns default to 60s out / 300s in for compute and 60s / 60s for
//! tasks. Every applied change is written to the state store and the
//! shared `FleetView`.

pub mod controller;
pub mod policy;

pub use controller::{
    AutoscaleError, AutoscaleResult, CapacityController, FleetScaler, UtilizationSource,
};
pub use policy::{CapacityPolicy, FleetPolicy, ScalingDecision, ScalingReason, decide};
