//! Persisted domain types.

use serde::{Deserialize, Serialize};

use stagecraft_core::{ArtifactReference, ContentDigest, Fleet, Pipeline, SourceRevision};
use stagecraft_rollout::{AttemptStatus, DeploymentAttempt};

/// Unique identifier for a pipeline run.
pub type RunId = String;

// ── Runs ──────────────────────────────────────────────────────────

/// Overall status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    /// Resolving the artifact.
    Building,
    /// Walking the stages.
    Deploying,
    /// Suspended at a production gate.
    AwaitingApproval,
    Completed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Aborted)
    }
}

/// Why a run was aborted, kept for diagnosis and restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Stage that failed, or `None` if the run failed before any stage.
    pub stage: Option<String>,
    pub reason: String,
    /// Digest involved, if one had been resolved.
    pub digest: Option<ContentDigest>,
    /// Last stage that reached `Healthy` in this run.
    pub last_healthy_stage: Option<String>,
}

/// A pipeline run: one artifact promoted through every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    /// Snapshot of the pipeline taken when the run started.
    pub pipeline: Pipeline,
    pub source: SourceRevision,
    /// Resolved exactly once per run.
    pub artifact: Option<ArtifactReference>,
    pub status: RunStatus,
    /// One attempt per stage reached so far, in pipeline order.
    pub attempts: Vec<DeploymentAttempt>,
    /// Attempts discarded by a restart.
    #[serde(default)]
    pub archived_attempts: Vec<DeploymentAttempt>,
    pub failure: Option<RunFailure>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl RunRecord {
    pub fn new(run_id: RunId, pipeline: Pipeline, source: SourceRevision, now: u64) -> Self {
        Self {
            run_id,
            pipeline,
            source,
            artifact: None,
            status: RunStatus::NotStarted,
            attempts: Vec::new(),
            archived_attempts: Vec::new(),
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn attempt(&self, stage: &str) -> Option<&DeploymentAttempt> {
        self.attempts.iter().find(|a| a.stage == stage)
    }

    /// Most recent stage that reached `Healthy`.
    pub fn last_healthy_stage(&self) -> Option<&str> {
        self.attempts
            .iter()
            .rev()
            .find(|a| a.status == AttemptStatus::Healthy)
            .map(|a| a.stage.as_str())
    }

    /// Stage currently awaiting approval, if any.
    pub fn awaiting_stage(&self) -> Option<&str> {
        self.attempts
            .iter()
            .find(|a| a.status == AttemptStatus::AwaitingApproval)
            .map(|a| a.stage.as_str())
    }
}

// ── Operator signals ──────────────────────────────────────────────

/// An approval scoped to exactly one `(run, stage)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub run_id: RunId,
    pub stage: String,
    /// Free-form identity of whoever approved.
    pub approved_by: Option<String>,
    pub approved_at: u64,
}

impl ApprovalRecord {
    pub fn table_key(&self) -> String {
        approval_key(&self.run_id, &self.stage)
    }
}

pub fn approval_key(run_id: &str, stage: &str) -> String {
    format!("{run_id}:{stage}")
}

/// A request to stop a run at the next stage boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortRequest {
    pub run_id: RunId,
    pub reason: String,
    pub requested_at: u64,
}

// ── Releases ──────────────────────────────────────────────────────

/// The last artifact that reached `Healthy` on a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRelease {
    pub pipeline: String,
    pub stage: String,
    pub artifact: ArtifactReference,
    pub run_id: RunId,
    pub released_at: u64,
}

impl StageRelease {
    pub fn table_key(&self) -> String {
        release_key(&self.pipeline, &self.stage)
    }
}

pub fn release_key(pipeline: &str, stage: &str) -> String {
    format!("{pipeline}/{stage}")
}

// ── Scaling ───────────────────────────────────────────────────────

/// Current size and cooldown bookkeeping for one fleet of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingState {
    pub pipeline: String,
    pub stage: String,
    pub fleet: Fleet,
    pub current_count: u32,
    /// Unix timestamp of the last scale-in, 0 if never.
    pub last_scale_in_at: u64,
    /// Unix timestamp of the last scale-out, 0 if never.
    pub last_scale_out_at: u64,
}

impl ScalingState {
    pub fn new(pipeline: &str, stage: &str, fleet: Fleet, current_count: u32) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            stage: stage.to_string(),
            fleet,
            current_count,
            last_scale_in_at: 0,
            last_scale_out_at: 0,
        }
    }

    pub fn table_key(&self) -> String {
        scaling_key(&self.pipeline, &self.stage, self.fleet)
    }
}

pub fn scaling_key(pipeline: &str, stage: &str, fleet: Fleet) -> String {
    format!("{pipeline}/{stage}:{fleet}")
}
