//! Target-tracking policy and the pure scaling decision.

use std::time::Duration;

use serde::Serialize;

use stagecraft_core::config::{CapacitySection, CooldownSection, duration_or};
use stagecraft_core::{CapacityBounds, Fleet};
use stagecraft_state::ScalingState;

/// Target CPU utilization in percent.
pub const DEFAULT_TARGET_CPU: f64 = 60.0;

/// Relative band around the target inside which nothing changes.
pub const DEAD_BAND: f64 = 0.10;

/// Cooldown windows for one fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FleetPolicy {
    pub scale_out_cooldown: Duration,
    pub scale_in_cooldown: Duration,
}

impl FleetPolicy {
    /// Defaults per fleet: compute 60s out / 300s in, task 60s / 60s.
    pub fn default_for(fleet: Fleet) -> Self {
        match fleet {
            Fleet::Compute => Self {
                scale_out_cooldown: Duration::from_secs(60),
                scale_in_cooldown: Duration::from_secs(300),
            },
            Fleet::Task => Self {
                scale_out_cooldown: Duration::from_secs(60),
                scale_in_cooldown: Duration::from_secs(60),
            },
        }
    }

    fn from_section(fleet: Fleet, section: Option<&CooldownSection>) -> Self {
        let defaults = Self::default_for(fleet);
        let Some(s) = section else {
            return defaults;
        };
        Self {
            scale_out_cooldown: duration_or(
                s.scale_out_cooldown.as_deref(),
                defaults.scale_out_cooldown,
            ),
            scale_in_cooldown: duration_or(s.scale_in_cooldown.as_deref(), defaults.scale_in_cooldown),
        }
    }
}

/// Capacity policy shared by every stage of a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct CapacityPolicy {
    pub target_cpu: f64,
    pub compute: FleetPolicy,
    pub task: FleetPolicy,
}

impl Default for CapacityPolicy {
    fn default() -> Self {
        Self {
            target_cpu: DEFAULT_TARGET_CPU,
            compute: FleetPolicy::default_for(Fleet::Compute),
            task: FleetPolicy::default_for(Fleet::Task),
        }
    }
}

impl CapacityPolicy {
    pub fn from_section(section: Option<&CapacitySection>) -> Self {
        let Some(s) = section else {
            return Self::default();
        };
        Self {
            target_cpu: s
                .target_cpu
                .filter(|t| t.is_finite() && *t > 0.0)
                .unwrap_or(DEFAULT_TARGET_CPU),
            compute: FleetPolicy::from_section(Fleet::Compute, s.compute.as_ref()),
            task: FleetPolicy::from_section(Fleet::Task, s.task.as_ref()),
        }
    }

    pub fn fleet(&self, fleet: Fleet) -> &FleetPolicy {
        match fleet {
            Fleet::Compute => &self.compute,
            Fleet::Task => &self.task,
        }
    }
}

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingReason {
    /// Utilization inside the dead band, or already at a bound.
    OnTarget,
    ScaleOut,
    ScaleIn,
    /// A change was wanted but the direction's cooldown is still running.
    CoolingDown,
    /// The count was outside `[min, max]` and is pulled back in.
    Clamped,
}

/// Outcome of one reconcile step for one fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScalingDecision {
    pub fleet: Fleet,
    pub current: u32,
    pub desired: u32,
    /// `desired - current`.
    pub delta: i64,
    /// Earliest Unix time the next change in this direction is allowed.
    pub cooldown_until: Option<u64>,
    pub reason: ScalingReason,
}

impl ScalingDecision {
    pub fn is_change(&self) -> bool {
        self.delta != 0
    }
}

/// Decide the next count for one fleet.
///
/// `desired = ceil(current * observed / target)`, skipped inside the dead
/// band, gated by the direction's cooldown and clamped to `bounds`. A count
/// already outside `bounds` is clamped back at once, cooldown or not.
pub fn decide(
    state: &ScalingState,
    bounds: CapacityBounds,
    policy: &FleetPolicy,
    target_cpu: f64,
    observed_cpu: f64,
    now: u64,
) -> ScalingDecision {
    let current = state.current_count;
    let decision = |desired: u32, cooldown_until: Option<u64>, reason: ScalingReason| {
        ScalingDecision {
            fleet: state.fleet,
            current,
            desired,
            delta: i64::from(desired) - i64::from(current),
            cooldown_until,
            reason,
        }
    };

    if !bounds.contains(current) {
        return decision(bounds.clamp(current), None, ScalingReason::Clamped);
    }

    let ratio = observed_cpu / target_cpu;
    if !ratio.is_finite() || (ratio - 1.0).abs() <= DEAD_BAND {
        return decision(current, None, ScalingReason::OnTarget);
    }

    // An empty fleet still has to grow when there is load.
    let base = f64::from(current.max(1));
    let raw = (base * ratio).ceil();
    let wanted = if raw <= 0.0 {
        0
    } else if raw >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        raw as u32
    };
    let desired = bounds.clamp(wanted);

    if desired == current {
        return decision(current, None, ScalingReason::OnTarget);
    }

    let (last, cooldown, reason) = if desired > current {
        (state.last_scale_out_at, policy.scale_out_cooldown, ScalingReason::ScaleOut)
    } else {
        (state.last_scale_in_at, policy.scale_in_cooldown, ScalingReason::ScaleIn)
    };
    let cooldown = cooldown.as_secs();

    // A timestamp of 0 means the fleet has never moved in this direction.
    if last > 0 && now < last + cooldown {
        return decision(current, Some(last + cooldown), ScalingReason::CoolingDown);
    }

    decision(desired, Some(now + cooldown), reason)
}
