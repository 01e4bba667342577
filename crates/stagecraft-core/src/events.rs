//! Observability egress: events the orchestrator emits on transitions.
//!
//! The core only produces events. Routing them to alarms or chat is the
//! job of whatever `EventSink` the daemon is assembled with.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::artifact::ContentDigest;
use crate::health::HealthVerdict;

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    ArtifactResolved { digest: ContentDigest },
    StageSuspended { reason: String },
    StageApproved,
    RolloutStarted { digest: ContentDigest },
    HealthChanged {
        verdict: HealthVerdict,
        compute_count: Option<u32>,
        task_count: Option<u32>,
    },
    StageHealthy { digest: ContentDigest },
    StageRolledBack { to: ContentDigest },
    StageFailed { reason: String },
    RunCompleted,
    RunAborted { reason: String },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::RunStarted => "run_started",
            EventKind::ArtifactResolved { .. } => "artifact_resolved",
            EventKind::StageSuspended { .. } => "stage_suspended",
            EventKind::StageApproved => "stage_approved",
            EventKind::RolloutStarted { .. } => "rollout_started",
            EventKind::HealthChanged { .. } => "health_changed",
            EventKind::StageHealthy { .. } => "stage_healthy",
            EventKind::StageRolledBack { .. } => "stage_rolled_back",
            EventKind::StageFailed { .. } => "stage_failed",
            EventKind::RunCompleted => "run_completed",
            EventKind::RunAborted { .. } => "run_aborted",
        }
    }
}

/// `{stage, eventType, timestamp}` plus the run it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub run_id: Option<String>,
    pub stage: Option<String>,
    pub kind: EventKind,
    pub timestamp: u64,
}

impl PipelineEvent {
    pub fn new(run_id: Option<&str>, stage: Option<&str>, kind: EventKind) -> Self {
        Self {
            run_id: run_id.map(str::to_string),
            stage: stage.map(str::to_string),
            kind,
            timestamp: crate::clock::epoch_secs(),
        }
    }
}

/// Receives events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Logs every event at `info`.
#[derive(Debug, Default, Clone)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: PipelineEvent) {
        info!(
            event = event.kind.name(),
            run_id = event.run_id.as_deref().unwrap_or("-"),
            stage = event.stage.as_deref().unwrap_or("-"),
            timestamp = event.timestamp,
            "pipeline event"
        );
    }
}

/// Keeps events in memory. Cloned handles share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct MemoryEventSink {
    events: Arc<Mutex<Vec<PipelineEvent>>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Event names in emission order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.kind.name()).collect()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: PipelineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
