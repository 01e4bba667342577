//! stagecraft-core — shared types for the Stagecraft release orchestrator.
//!
//! - **`stage`**: `StageDescriptor` and the immutable, ordered `Pipeline`
//! - **`artifact`**: `ArtifactReference` and `ContentDigest`
//! - **`health`**: `HealthVerdict`
//! - **`source`**: `SourceRevision`, the trigger payload that starts a run
//! - **`config`**: `stagecraft.toml` parsing
//! - **`events`**: `EventSink` and the events emitted on transitions
//! - **`duration`**: `"30s"` / `"5m"` style duration strings

pub mod artifact;
pub mod clock;
pub mod config;
pub mod duration;
pub mod events;
pub mod health;
pub mod source;
pub mod stage;

pub use artifact::{ArtifactReference, ContentDigest, DigestError};
pub use config::StagecraftConfig;
pub use clock::epoch_secs;
pub use duration::parse_duration;
pub use events::{EventKind, EventSink, MemoryEventSink, PipelineEvent, TracingEventSink};
pub use health::HealthVerdict;
pub use source::{SourceError, SourceRevision};
pub use stage::{
    CapacityBounds, Environment, Fleet, HealthEndpoint, Pipeline, PipelineError,
    StageDescriptor,
};
