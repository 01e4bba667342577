//! Pipeline sequencer: drives one run through its stages.
//!
//! A run resolves its artifact once, then for each stage in order:
//! create the attempt, evaluate the gate, deploy, observe health and let
//! the circuit breaker decide. The record is persisted before every side
//! effect. Operator signals (approvals, aborts) are written to their own
//! tables and picked up by the driver at stage boundaries.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, warn};

use stagecraft_artifact::ResolveArtifact;
use stagecraft_core::{
    ArtifactReference, EventKind, EventSink, Pipeline, PipelineEvent, SourceRevision,
    StageDescriptor, epoch_secs,
};
use stagecraft_health::{HealthMonitor, Prober};
use stagecraft_rollout::{AttemptStatus, BreakerAction, CircuitBreaker, DeploymentAttempt, TransitionError};
use stagecraft_state::{
    AbortRequest, ApprovalRecord, RunFailure, RunId, RunRecord, RunStatus, StageRelease, StateError,
    StateStore,
};

use crate::gate::{self, ApprovalPolicy, GateDecision, GateTimeout};

/// Errors from sequencer operations.
#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("run {run_id} belongs to pipeline {pipeline}")]
    ForeignRun { run_id: String, pipeline: String },

    #[error("run {run_id}: unknown stage {stage}")]
    UnknownStage { run_id: String, stage: String },

    #[error("run {run_id}: stage {stage} is not awaiting approval")]
    NotAwaitingApproval { run_id: String, stage: String },

    #[error("pipeline {pipeline} already has an active run: {run_id}")]
    RunActive { pipeline: String, run_id: String },

    #[error("run {run_id} is already {status:?}")]
    RunFinished { run_id: String, status: RunStatus },

    #[error("run {run_id}: {source}")]
    ApprovalExpired {
        run_id: String,
        #[source]
        source: GateTimeout,
    },

    #[error("run {run_id} cannot be restarted: {reason}")]
    NotRestartable { run_id: String, reason: String },

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

pub type SequencerResult<T> = Result<T, SequencerError>;

/// Where a `drive` call left the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// Waiting for an approval on this stage.
    Suspended { stage: String },
    Aborted { stage: Option<String>, reason: String },
}

/// Result of an abort request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    /// No driver was active; the run is now `Aborted`.
    Aborted,
    /// A driver is mid-stage and will stop at the next stage boundary.
    Requested,
}

/// Rolls an artifact out to a stage.
pub trait Deployer: Send + Sync {
    /// Deploy `artifact` to `stage`. Deploying the digest already running
    /// must be a no-op on the platform side.
    fn deploy(
        &self,
        pipeline: &str,
        stage: &StageDescriptor,
        artifact: &ArtifactReference,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

enum StageStep {
    Healthy,
    Suspended,
    Failed(String),
}

pub struct Sequencer<A, D, P> {
    pipeline: Pipeline,
    store: StateStore,
    resolver: A,
    deployer: D,
    health: HealthMonitor<P>,
    events: Arc<dyn EventSink>,
    approval: ApprovalPolicy,
    /// Held while checking for an active run and creating a new one.
    start_lock: Mutex<()>,
    /// One driver per run at a time.
    run_locks: Mutex<HashMap<RunId, Arc<tokio::sync::Mutex<()>>>>,
}

impl<A: ResolveArtifact, D: Deployer, P: Prober> Sequencer<A, D, P> {
    pub fn new(
        pipeline: Pipeline,
        store: StateStore,
        resolver: A,
        deployer: D,
        health: HealthMonitor<P>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            pipeline,
            store,
            resolver,
            deployer,
            health,
            events,
            approval: ApprovalPolicy::default(),
            start_lock: Mutex::new(()),
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_approval_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.approval = policy;
        self
    }

    pub fn approval_policy(&self) -> &ApprovalPolicy {
        &self.approval
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn resolver(&self) -> &A {
        &self.resolver
    }

    pub fn deployer(&self) -> &D {
        &self.deployer
    }

    pub fn health(&self) -> &HealthMonitor<P> {
        &self.health
    }

    fn emit(&self, run_id: &str, stage: Option<&str>, kind: EventKind) {
        self.events.emit(PipelineEvent::new(Some(run_id), stage, kind));
    }

    fn run_lock(&self, run_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.run_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(run_id.to_string()).or_default().clone()
    }

    fn load(&self, run_id: &str) -> SequencerResult<RunRecord> {
        let run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| SequencerError::RunNotFound(run_id.to_string()))?;
        if run.pipeline.name() != self.pipeline.name() {
            return Err(SequencerError::ForeignRun {
                run_id: run_id.to_string(),
                pipeline: run.pipeline.name().to_string(),
            });
        }
        Ok(run)
    }

    fn persist(&self, run: &mut RunRecord) -> SequencerResult<()> {
        run.updated_at = epoch_secs();
        self.store.put_run(run)?;
        Ok(())
    }

    fn ensure_no_active_run(&self, except: Option<&str>) -> SequencerResult<()> {
        let active = self.store.active_runs_for_pipeline(self.pipeline.name())?;
        if let Some(other) = active.into_iter().find(|r| Some(r.run_id.as_str()) != except) {
            return Err(SequencerError::RunActive {
                pipeline: self.pipeline.name().to_string(),
                run_id: other.run_id,
            });
        }
        Ok(())
    }

    // ── Operations ─────────────────────────────────────────────────

    /// Create a run for `source`. Nothing is built until [`drive`](Self::drive).
    pub fn start(&self, source: SourceRevision) -> SequencerResult<RunId> {
        let _guard = self.start_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.ensure_no_active_run(None)?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let mut run = RunRecord::new(run_id.clone(), self.pipeline.clone(), source, epoch_secs());
        self.persist(&mut run)?;

        info!(%run_id, pipeline = %self.pipeline.name(), source = %run.source, "run started");
        self.emit(&run_id, None, EventKind::RunStarted);
        Ok(run_id)
    }

    /// The persisted record of a run.
    pub fn status(&self, run_id: &str) -> SequencerResult<RunRecord> {
        self.load(run_id)
    }

    /// Runs of this pipeline that have not finished, oldest first.
    pub fn active_runs(&self) -> SequencerResult<Vec<RunRecord>> {
        Ok(self.store.active_runs_for_pipeline(self.pipeline.name())?)
    }

    /// Record an approval for exactly `(run_id, stage)`.
    ///
    /// Only accepted while that stage is `AwaitingApproval` and its gate has
    /// not expired. An approval that arrives after expiry fails the stage and
    /// aborts the run instead. The run does not move until it is driven again.
    pub async fn approve(&self, run_id: &str, stage: &str, approved_by: Option<String>) -> SequencerResult<()> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let mut run = self.load(run_id)?;
        if run.status.is_terminal() {
            return Err(SequencerError::RunFinished {
                run_id: run_id.to_string(),
                status: run.status,
            });
        }
        if run.pipeline.stage(stage).is_none() {
            return Err(SequencerError::UnknownStage {
                run_id: run_id.to_string(),
                stage: stage.to_string(),
            });
        }
        let Some(index) = run
            .attempts
            .iter()
            .position(|a| a.stage == stage && a.status == AttemptStatus::AwaitingApproval)
        else {
            return Err(SequencerError::NotAwaitingApproval {
                run_id: run_id.to_string(),
                stage: stage.to_string(),
            });
        };

        let now = epoch_secs();
        if let Err(timeout) = self.gate_open_at(&run, index, now) {
            self.expire_gate(&mut run, index, &timeout)?;
            return Err(SequencerError::ApprovalExpired {
                run_id: run_id.to_string(),
                source: timeout,
            });
        }

        self.store.put_approval(&ApprovalRecord {
            run_id: run_id.to_string(),
            stage: stage.to_string(),
            approved_by: approved_by.clone(),
            approved_at: now,
        })?;
        info!(%run_id, %stage, approved_by = approved_by.as_deref().unwrap_or("-"), "approval recorded");
        Ok(())
    }

    /// Fail every suspended run whose gate expired without an approval.
    ///
    /// Returns the runs that were aborted. A no-op unless the approval
    /// policy has an expiry.
    pub async fn expire_overdue_gates(&self) -> SequencerResult<Vec<(RunId, RunOutcome)>> {
        if self.approval.expires_after.is_none() {
            return Ok(Vec::new());
        }

        let now = epoch_secs();
        let mut expired = Vec::new();
        for run in self.active_runs()? {
            if run.status != RunStatus::AwaitingApproval {
                continue;
            }
            let Some(index) = run
                .attempts
                .iter()
                .position(|a| a.status == AttemptStatus::AwaitingApproval)
            else {
                continue;
            };
            let stage = &run.attempts[index].stage;
            if self.store.get_approval(&run.run_id, stage)?.is_some() {
                continue;
            }
            if self.gate_open_at(&run, index, now).is_ok() {
                continue;
            }

            debug!(run_id = %run.run_id, %stage, "approval gate overdue");
            let outcome = self.drive(&run.run_id).await?;
            if matches!(outcome, RunOutcome::Aborted { .. }) {
                expired.push((run.run_id, outcome));
            }
        }
        Ok(expired)
    }

    /// Ask a run to stop.
    ///
    /// With no active driver the run is aborted right away. Otherwise the
    /// driver stops at the next stage boundary; an in-flight rollout is
    /// always allowed to finish first.
    pub async fn abort(&self, run_id: &str, reason: &str) -> SequencerResult<AbortOutcome> {
        let run = self.load(run_id)?;
        if run.status.is_terminal() {
            return Err(SequencerError::RunFinished {
                run_id: run_id.to_string(),
                status: run.status,
            });
        }

        self.store.put_abort(&AbortRequest {
            run_id: run_id.to_string(),
            reason: reason.to_string(),
            requested_at: epoch_secs(),
        })?;

        let lock = self.run_lock(run_id);
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            // A driver that already suspended the run is about to release it.
            Err(_) if self.load(run_id)?.status == RunStatus::AwaitingApproval => lock.lock().await,
            Err(_) => {
                info!(%run_id, %reason, "abort requested, driver will stop at next stage boundary");
                return Ok(AbortOutcome::Requested);
            }
        };

        let mut run = self.load(run_id)?;
        match run.status {
            RunStatus::Aborted => Ok(AbortOutcome::Aborted),
            RunStatus::Completed => {
                self.store.clear_abort(run_id)?;
                Err(SequencerError::RunFinished {
                    run_id: run_id.to_string(),
                    status: run.status,
                })
            }
            _ => {
                self.finish_aborted(&mut run, None, reason.to_string())?;
                Ok(AbortOutcome::Aborted)
            }
        }
    }

    /// Resume an aborted run from its failing stage with the same artifact.
    ///
    /// Stages that already reached `Healthy` are kept. The failing stage and
    /// everything after it start over from `Pending`; their old attempts and
    /// approvals are discarded.
    pub async fn restart(&self, run_id: &str) -> SequencerResult<RunOutcome> {
        self.reopen(run_id).await?;
        self.drive(run_id).await
    }

    /// The first half of [`restart`](Self::restart): reset the run so the
    /// next `drive` resumes it.
    pub async fn reopen(&self, run_id: &str) -> SequencerResult<()> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;
        self.prepare_restart(run_id)
    }

    fn prepare_restart(&self, run_id: &str) -> SequencerResult<()> {
        let _start = self.start_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut run = self.load(run_id)?;

        let not_restartable = |reason: String| SequencerError::NotRestartable {
            run_id: run_id.to_string(),
            reason,
        };
        if run.status != RunStatus::Aborted {
            return Err(not_restartable(format!("run is {:?}", run.status)));
        }
        if run.artifact.is_none() {
            return Err(not_restartable("artifact was never resolved".to_string()));
        }
        self.ensure_no_active_run(Some(run_id))?;

        let from = run
            .attempts
            .iter()
            .position(|a| a.status != AttemptStatus::Healthy)
            .unwrap_or(run.attempts.len());
        let discarded: Vec<DeploymentAttempt> = run.attempts.drain(from..).collect();
        for attempt in &discarded {
            self.store.delete_approval(run_id, &attempt.stage)?;
        }

        info!(
            %run_id,
            from_stage = discarded.first().map(|a| a.stage.as_str()).unwrap_or("-"),
            kept = run.attempts.len(),
            "restarting run"
        );

        run.archived_attempts.extend(discarded);
        run.failure = None;
        run.status = RunStatus::Deploying;
        self.store.clear_abort(run_id)?;
        self.persist(&mut run)?;
        Ok(())
    }

    /// Drive every unfinished run of this pipeline, e.g. after a restart
    /// of the daemon.
    pub async fn resume_all(&self) -> SequencerResult<Vec<(RunId, RunOutcome)>> {
        let mut outcomes = Vec::new();
        for run in self.active_runs()? {
            let outcome = self.drive(&run.run_id).await?;
            outcomes.push((run.run_id, outcome));
        }
        Ok(outcomes)
    }

    /// Advance a run as far as it can go.
    ///
    /// Returns when the run completes, aborts, or suspends at a gate.
    /// Driving a finished run returns its final outcome.
    pub async fn drive(&self, run_id: &str) -> SequencerResult<RunOutcome> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let mut run = self.load(run_id)?;
        if let Some(outcome) = final_outcome(&run) {
            return Ok(outcome);
        }
        if let Some(outcome) = self.take_abort(&mut run)? {
            return Ok(outcome);
        }

        let artifact = match run.artifact.clone() {
            Some(artifact) => artifact,
            None => {
                run.status = RunStatus::Building;
                self.persist(&mut run)?;
                match self.resolver.resolve(&run.source).await {
                    Ok(artifact) => {
                        run.artifact = Some(artifact.clone());
                        run.status = RunStatus::Deploying;
                        self.persist(&mut run)?;
                        info!(%run_id, digest = %artifact.content_digest, "artifact resolved");
                        self.emit(
                            run_id,
                            None,
                            EventKind::ArtifactResolved {
                                digest: artifact.content_digest.clone(),
                            },
                        );
                        artifact
                    }
                    Err(e) => return self.finish_aborted(&mut run, None, e.to_string()),
                }
            }
        };

        let stages = run.pipeline.stages().to_vec();
        for stage in &stages {
            let existing = run.attempts.iter().position(|a| a.stage == stage.name);

            let index = match existing {
                Some(i) => match run.attempts[i].status {
                    AttemptStatus::Healthy => continue,
                    AttemptStatus::RolledBack | AttemptStatus::Failed => {
                        let reason = run.attempts[i]
                            .failure_reason
                            .clone()
                            .unwrap_or_else(|| "stage failed".to_string());
                        return self.finish_aborted(&mut run, Some(stage.name.clone()), reason);
                    }
                    AttemptStatus::InProgress => i,
                    AttemptStatus::Pending | AttemptStatus::AwaitingApproval => {
                        if let Some(outcome) = self.take_abort(&mut run)? {
                            return Ok(outcome);
                        }
                        i
                    }
                },
                None => {
                    if let Some(outcome) = self.take_abort(&mut run)? {
                        return Ok(outcome);
                    }
                    let previous = self
                        .store
                        .get_release(run.pipeline.name(), &stage.name)?
                        .map(|r| r.artifact);
                    run.attempts.push(DeploymentAttempt::new(
                        &stage.name,
                        artifact.clone(),
                        previous,
                        epoch_secs(),
                    ));
                    self.persist(&mut run)?;
                    run.attempts.len() - 1
                }
            };

            match self.run_stage(&mut run, index, stage, &artifact).await? {
                StageStep::Healthy => {}
                StageStep::Suspended => {
                    if let Some(outcome) = self.take_abort(&mut run)? {
                        return Ok(outcome);
                    }
                    return Ok(RunOutcome::Suspended {
                        stage: stage.name.clone(),
                    });
                }
                StageStep::Failed(reason) => {
                    return self.finish_aborted(&mut run, Some(stage.name.clone()), reason);
                }
            }
        }

        run.status = RunStatus::Completed;
        self.persist(&mut run)?;
        // An abort that arrived during the last rollout has nothing left to stop.
        self.store.clear_abort(run_id)?;
        info!(%run_id, digest = %artifact.content_digest, "run completed");
        self.emit(run_id, None, EventKind::RunCompleted);
        Ok(RunOutcome::Completed)
    }

    /// Gate, deploy and observe one stage.
    async fn run_stage(
        &self,
        run: &mut RunRecord,
        index: usize,
        stage: &StageDescriptor,
        artifact: &ArtifactReference,
    ) -> SequencerResult<StageStep> {
        let run_id = run.run_id.clone();
        let now = epoch_secs();

        match run.attempts[index].status {
            AttemptStatus::Pending => {
                if let GateDecision::Suspend(reason) = gate::evaluate(stage) {
                    run.attempts[index].await_approval(now)?;
                    run.status = RunStatus::AwaitingApproval;
                    self.persist(run)?;
                    self.emit(&run_id, Some(&stage.name), EventKind::StageSuspended { reason });
                    return Ok(StageStep::Suspended);
                }
            }
            AttemptStatus::AwaitingApproval => {
                let approval = self.store.get_approval(&run_id, &stage.name)?;
                // An approval only counts if it arrived while the gate was open.
                let decided_at = approval.as_ref().map(|a| a.approved_at).unwrap_or(now);
                if let Err(timeout) = self.gate_open_at(run, index, decided_at) {
                    let reason = timeout.to_string();
                    run.attempts[index].fail(reason.clone(), now)?;
                    self.persist(run)?;
                    self.emit(&run_id, Some(&stage.name), EventKind::StageFailed { reason: reason.clone() });
                    return Ok(StageStep::Failed(reason));
                }
                if approval.is_none() {
                    if run.status != RunStatus::AwaitingApproval {
                        run.status = RunStatus::AwaitingApproval;
                        self.persist(run)?;
                    }
                    debug!(%run_id, stage = %stage.name, "still awaiting approval");
                    return Ok(StageStep::Suspended);
                }
                info!(%run_id, stage = %stage.name, "approval received");
                self.emit(&run_id, Some(&stage.name), EventKind::StageApproved);
            }
            AttemptStatus::InProgress => {
                warn!(%run_id, stage = %stage.name, "resuming interrupted rollout");
                if run.attempts[index].rollback_attempted {
                    return self.finish_revert(run, index, stage).await;
                }
            }
            status => {
                return Err(TransitionError {
                    stage: stage.name.clone(),
                    action: "drive",
                    from: status,
                }
                .into());
            }
        }

        if run.attempts[index].status != AttemptStatus::InProgress {
            run.attempts[index].begin_rollout(now)?;
        }
        run.status = RunStatus::Deploying;
        self.persist(run)?;
        self.emit(
            &run_id,
            Some(&stage.name),
            EventKind::RolloutStarted {
                digest: artifact.content_digest.clone(),
            },
        );

        if let Err(e) = self.deployer.deploy(run.pipeline.name(), stage, artifact).await {
            let reason = format!("deploy failed: {e}");
            run.attempts[index].fail(reason.clone(), epoch_secs())?;
            self.persist(run)?;
            self.emit(&run_id, Some(&stage.name), EventKind::StageFailed { reason: reason.clone() });
            return Ok(StageStep::Failed(reason));
        }

        let verdict = self
            .health
            .observe(run.pipeline.name(), &run_id, stage, &run.attempts[index])
            .await;

        let now = epoch_secs();
        match CircuitBreaker::on_verdict(&mut run.attempts[index], verdict, now)? {
            BreakerAction::Promote => {
                let release = StageRelease {
                    pipeline: run.pipeline.name().to_string(),
                    stage: stage.name.clone(),
                    artifact: artifact.clone(),
                    run_id: run_id.clone(),
                    released_at: now,
                };
                run.updated_at = now;
                self.store.put_run_with_release(run, &release)?;
                self.emit(
                    &run_id,
                    Some(&stage.name),
                    EventKind::StageHealthy {
                        digest: artifact.content_digest.clone(),
                    },
                );
                Ok(StageStep::Healthy)
            }
            BreakerAction::Revert { .. } => {
                // Record that the breaker tripped before touching the stage.
                self.persist(run)?;
                self.finish_revert(run, index, stage).await
            }
            BreakerAction::Exhausted => {
                self.persist(run)?;
                let reason = run.attempts[index]
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "rollback exhausted".to_string());
                self.emit(&run_id, Some(&stage.name), EventKind::StageFailed { reason: reason.clone() });
                Ok(StageStep::Failed(reason))
            }
            BreakerAction::Continue => {
                let reason = "health verdict undecided".to_string();
                run.attempts[index].fail(reason.clone(), now)?;
                self.persist(run)?;
                self.emit(&run_id, Some(&stage.name), EventKind::StageFailed { reason: reason.clone() });
                Ok(StageStep::Failed(reason))
            }
        }
    }

    /// Redeploy the attempt's previous healthy artifact and record how it went.
    async fn finish_revert(
        &self,
        run: &mut RunRecord,
        index: usize,
        stage: &StageDescriptor,
    ) -> SequencerResult<StageStep> {
        let run_id = run.run_id.clone();
        let Some(target) = run.attempts[index].previous_healthy_artifact.clone() else {
            let reason = "rollback target missing".to_string();
            run.attempts[index].fail(reason.clone(), epoch_secs())?;
            self.persist(run)?;
            return Ok(StageStep::Failed(reason));
        };

        let outcome = self
            .deployer
            .deploy(run.pipeline.name(), stage, &target)
            .await
            .map_err(|e| e.to_string());
        CircuitBreaker::revert_finished(&mut run.attempts[index], outcome, epoch_secs())?;
        self.persist(run)?;

        let attempt = &run.attempts[index];
        let reason = attempt
            .failure_reason
            .clone()
            .unwrap_or_else(|| "rolled back".to_string());
        if attempt.status == AttemptStatus::RolledBack {
            self.emit(
                &run_id,
                Some(&stage.name),
                EventKind::StageRolledBack {
                    to: target.content_digest.clone(),
                },
            );
        } else {
            self.emit(&run_id, Some(&stage.name), EventKind::StageFailed { reason: reason.clone() });
        }
        Ok(StageStep::Failed(reason))
    }

    /// Whether the gate of a suspended attempt is still open at `at`.
    fn gate_open_at(&self, run: &RunRecord, index: usize, at: u64) -> Result<(), GateTimeout> {
        let attempt = &run.attempts[index];
        let since = attempt.awaiting_since.unwrap_or(attempt.created_at);
        self.approval.check(&attempt.stage, since, at)
    }

    /// Fail an attempt whose gate expired and abort the run.
    fn expire_gate(&self, run: &mut RunRecord, index: usize, timeout: &GateTimeout) -> SequencerResult<RunOutcome> {
        let reason = timeout.to_string();
        let stage = run.attempts[index].stage.clone();
        run.attempts[index].fail(reason.clone(), epoch_secs())?;
        self.emit(&run.run_id, Some(&stage), EventKind::StageFailed { reason: reason.clone() });
        self.finish_aborted(run, Some(stage), reason)
    }

    /// Honor a pending abort request, if any.
    fn take_abort(&self, run: &mut RunRecord) -> SequencerResult<Option<RunOutcome>> {
        match self.store.get_abort(&run.run_id)? {
            Some(request) => Ok(Some(self.finish_aborted(run, None, request.reason)?)),
            None => Ok(None),
        }
    }

    fn finish_aborted(
        &self,
        run: &mut RunRecord,
        stage: Option<String>,
        reason: String,
    ) -> SequencerResult<RunOutcome> {
        let now = epoch_secs();
        let stage = stage.or_else(|| {
            run.attempts
                .iter()
                .find(|a| a.status != AttemptStatus::Healthy)
                .map(|a| a.stage.clone())
        });

        for attempt in run.attempts.iter_mut().filter(|a| !a.status.is_terminal()) {
            attempt.fail(format!("run aborted: {reason}"), now)?;
        }

        run.failure = Some(RunFailure {
            stage: stage.clone(),
            reason: reason.clone(),
            digest: run.artifact.as_ref().map(|a| a.content_digest.clone()),
            last_healthy_stage: run.last_healthy_stage().map(str::to_string),
        });
        run.status = RunStatus::Aborted;
        self.persist(run)?;
        self.store.clear_abort(&run.run_id)?;

        warn!(
            run_id = %run.run_id,
            stage = stage.as_deref().unwrap_or("-"),
            %reason,
            "run aborted"
        );
        self.emit(
            &run.run_id,
            stage.as_deref(),
            EventKind::RunAborted {
                reason: reason.clone(),
            },
        );
        Ok(RunOutcome::Aborted { stage, reason })
    }
}

/// Outcome of a run that has already finished.
fn final_outcome(run: &RunRecord) -> Option<RunOutcome> {
    match run.status {
        RunStatus::Completed => Some(RunOutcome::Completed),
        RunStatus::Aborted => {
            let failure = run.failure.as_ref();
            Some(RunOutcome::Aborted {
                stage: failure.and_then(|f| f.stage.clone()),
                reason: failure.map(|f| f.reason.clone()).unwrap_or_default(),
            })
        }
        _ => None,
    }
}
