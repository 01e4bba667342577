//! stagecraft-state — durable run state for Stagecraft.
//!
//! Backed by [redb](https://docs.rs/redb). A pipeline run can sit in
//! `AwaitingApproval` for days, so everything needed to resume it lives
//! here: the run record (pipeline snapshot, resolved artifact, per-stage
//! attempts), approvals, abort requests, each stage's last known-good
//! artifact, and fleet scaling state.
//!
//! # Architecture
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns.
//! Approvals and abort requests live in their own tables so an operator
//! writing them never races the sequencer writing the run record.
//!
//! `FleetView` is an in-memory read handle over the latest scaling state,
//! written by the capacity controller alongside the store.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod fleet;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use fleet::FleetView;
pub use store::StateStore;
pub use types::*;
