//! stagecraft-health — health observation for Stagecraft stages.
//!
//! Provides HTTP health probes, a hysteresis tracker, and the monitor that
//! watches a rollout until it settles.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   ├── observe(): rollout gate, returns Healthy or Unhealthy
//!   │   ├── HealthTracker (consecutive successes / failures)
//!   │   ├── Prober::probe() → ProbeResult
//!   │   └── EventSink ← HealthChanged (with fleet sizes)
//!   └── Per-stage background task for steady-state monitoring
//! ```
//!
//! # Hysteresis
//!
//! A verdict only flips after `healthy_threshold` consecutive successes or
//! `unhealthy_threshold` consecutive failures (defaults 3 and 2). A probe
//! that times out counts as a failure.

pub mod checker;
pub mod monitor;
pub mod settings;

pub use checker::{HealthTracker, HttpProber, ProbeResult, Prober};
pub use monitor::HealthMonitor;
pub use settings::HealthSettings;
