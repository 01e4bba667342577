//! stagecraft-pipeline — walks a release through its stages.
//!
//! - **`gate`**: decides whether a stage may proceed unattended
//! - **`sequencer`**: the per-run state machine: resolve the artifact once,
//!   then gate, deploy and observe each stage in order
//!
//! # Run lifecycle
//!
//! ```text
//! NotStarted → Building → Deploying ─┬→ Completed
//!                            ↕       └→ Aborted
//!                     AwaitingApproval
//! ```
//!
//! Every transition is persisted before the side effect it guards, so a
//! daemon restart resumes a run from its record without rebuilding.

pub mod gate;
pub mod sequencer;

pub use gate::{ApprovalPolicy, GateDecision, GateTimeout, evaluate};
pub use sequencer::{AbortOutcome, Deployer, RunOutcome, Sequencer, SequencerError, SequencerResult};
