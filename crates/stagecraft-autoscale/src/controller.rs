//! Capacity controller: per-stage, per-fleet target tracking.
//!
//! Reads CPU utilization for every fleet of every stage, decides a new
//! count with [`decide`], asks the platform to apply it, and writes the
//! resulting `ScalingState` through to the store and the shared
//! [`FleetView`].

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use stagecraft_core::{Fleet, Pipeline, StageDescriptor, epoch_secs};
use stagecraft_state::{FleetView, ScalingState, StateError, StateStore};

use crate::policy::{CapacityPolicy, ScalingDecision, ScalingReason, decide};

/// Errors from the capacity controller.
#[derive(Debug, Error)]
pub enum AutoscaleError {
    #[error("unknown stage: {0}")]
    UnknownStage(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type AutoscaleResult<T> = Result<T, AutoscaleError>;

/// Where observed CPU utilization comes from.
pub trait UtilizationSource: Send + Sync {
    /// Average CPU utilization of the fleet in percent, or `None` when
    /// there is no datapoint yet.
    fn cpu_utilization(
        &self,
        pipeline: &str,
        stage: &StageDescriptor,
        fleet: Fleet,
    ) -> impl Future<Output = anyhow::Result<Option<f64>>> + Send;
}

/// Applies a new desired count to a fleet.
pub trait FleetScaler: Send + Sync {
    fn scale_to(
        &self,
        pipeline: &str,
        stage: &StageDescriptor,
        fleet: Fleet,
        count: u32,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Drives target tracking for every stage of one pipeline.
pub struct CapacityController<U, S> {
    pipeline: Pipeline,
    policy: CapacityPolicy,
    store: StateStore,
    fleets: FleetView,
    source: U,
    scaler: S,
}

impl<U: UtilizationSource, S: FleetScaler> CapacityController<U, S> {
    pub fn new(
        pipeline: Pipeline,
        policy: CapacityPolicy,
        store: StateStore,
        fleets: FleetView,
        source: U,
        scaler: S,
    ) -> Self {
        Self {
            pipeline,
            policy,
            store,
            fleets,
            source,
            scaler,
        }
    }

    pub fn policy(&self) -> &CapacityPolicy {
        &self.policy
    }

    /// Make sure every fleet has a persisted state, starting at its minimum.
    pub fn seed(&self) -> AutoscaleResult<()> {
        for stage in self.pipeline.stages() {
            for fleet in Fleet::ALL {
                let state = self.load_state(stage, fleet)?;
                self.fleets.record(state);
            }
        }
        Ok(())
    }

    fn stage(&self, name: &str) -> AutoscaleResult<&StageDescriptor> {
        self.pipeline
            .stage(name)
            .ok_or_else(|| AutoscaleError::UnknownStage(name.to_string()))
    }

    /// Persisted state for a fleet, or a fresh one at `min` (stored).
    fn load_state(&self, stage: &StageDescriptor, fleet: Fleet) -> AutoscaleResult<ScalingState> {
        let name = self.pipeline.name();
        if let Some(state) = self.store.get_scaling(name, &stage.name, fleet)? {
            return Ok(state);
        }
        let state = ScalingState::new(name, &stage.name, fleet, stage.bounds(fleet).min);
        self.store.put_scaling(&state)?;
        debug!(pipeline = %name, stage = %stage.name, %fleet, count = state.current_count, "scaling state seeded");
        Ok(state)
    }

    fn plan(
        &self,
        stage: &StageDescriptor,
        fleet: Fleet,
        observed_cpu: f64,
        now: u64,
    ) -> AutoscaleResult<(ScalingState, ScalingDecision)> {
        let state = self.load_state(stage, fleet)?;
        let decision = decide(
            &state,
            stage.bounds(fleet),
            self.policy.fleet(fleet),
            self.policy.target_cpu,
            observed_cpu,
            now,
        );
        Ok((state, decision))
    }

    /// Record an applied decision. Only real scale-outs and scale-ins
    /// start a cooldown; clamping does not.
    fn commit(&self, mut state: ScalingState, decision: &ScalingDecision, now: u64) -> AutoscaleResult<()> {
        state.current_count = decision.desired;
        match decision.reason {
            ScalingReason::ScaleOut => state.last_scale_out_at = now,
            ScalingReason::ScaleIn => state.last_scale_in_at = now,
            _ => {}
        }
        self.store.put_scaling(&state)?;
        self.fleets.record(state);
        Ok(())
    }

    /// Reconcile one fleet against an observed utilization, now.
    pub fn reconcile(
        &self,
        stage: &str,
        fleet: Fleet,
        observed_cpu: f64,
    ) -> AutoscaleResult<ScalingDecision> {
        self.reconcile_at(stage, fleet, observed_cpu, epoch_secs())
    }

    /// Reconcile one fleet at an explicit time and record the result.
    pub fn reconcile_at(
        &self,
        stage: &str,
        fleet: Fleet,
        observed_cpu: f64,
        now: u64,
    ) -> AutoscaleResult<ScalingDecision> {
        let stage = self.stage(stage)?;
        let (state, decision) = self.plan(stage, fleet, observed_cpu, now)?;
        if decision.is_change() {
            self.commit(state, &decision, now)?;
        }
        Ok(decision)
    }

    /// One pass over every fleet of every stage.
    ///
    /// A failed utilization read or scaling call skips that fleet; the
    /// others are still reconciled.
    pub async fn tick_at(&self, now: u64) -> AutoscaleResult<Vec<(String, ScalingDecision)>> {
        let name = self.pipeline.name();
        let mut decisions = Vec::new();

        for stage in self.pipeline.stages() {
            for fleet in Fleet::ALL {
                let observed = match self.source.cpu_utilization(name, stage, fleet).await {
                    Ok(Some(v)) => v,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(stage = %stage.name, %fleet, error = %e, "utilization read failed");
                        continue;
                    }
                };

                let (state, decision) = self.plan(stage, fleet, observed, now)?;

                if decision.is_change() {
                    if let Err(e) = self.scaler.scale_to(name, stage, fleet, decision.desired).await {
                        warn!(
                            stage = %stage.name,
                            %fleet,
                            target = decision.desired,
                            error = %e,
                            "scaling action failed"
                        );
                        continue;
                    }
                    info!(
                        stage = %stage.name,
                        %fleet,
                        from = decision.current,
                        to = decision.desired,
                        observed,
                        reason = ?decision.reason,
                        "fleet scaled"
                    );
                    self.commit(state, &decision, now)?;
                } else {
                    debug!(stage = %stage.name, %fleet, observed, reason = ?decision.reason, "no scaling change");
                }

                decisions.push((stage.name.clone(), decision));
            }
        }

        Ok(decisions)
    }

    pub async fn tick(&self) -> AutoscaleResult<Vec<(String, ScalingDecision)>> {
        self.tick_at(epoch_secs()).await
    }

    /// Run the control loop until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            pipeline = %self.pipeline.name(),
            interval_secs = interval.as_secs(),
            "capacity controller started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "capacity reconcile failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("capacity controller shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use stagecraft_core::{CapacityBounds, Environment, HealthEndpoint};

    #[derive(Default, Clone)]
    struct FixedUtilization {
        values: HashMap<(String, Fleet), f64>,
    }

    impl FixedUtilization {
        fn with(mut self, stage: &str, fleet: Fleet, cpu: f64) -> Self {
            self.values.insert((stage.to_string(), fleet), cpu);
            self
        }
    }

    impl UtilizationSource for FixedUtilization {
        async fn cpu_utilization(
            &self,
            _pipeline: &str,
            stage: &StageDescriptor,
            fleet: Fleet,
        ) -> anyhow::Result<Option<f64>> {
            Ok(self.values.get(&(stage.name.clone(), fleet)).copied())
        }
    }

    #[derive(Default, Clone)]
    struct RecordingScaler {
        calls: Arc<Mutex<Vec<(String, Fleet, u32)>>>,
        fail: bool,
    }

    impl FleetScaler for RecordingScaler {
        async fn scale_to(
            &self,
            _pipeline: &str,
            stage: &StageDescriptor,
            fleet: Fleet,
            count: u32,
        ) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("api throttled");
            }
            self.calls.lock().unwrap().push((stage.name.clone(), fleet, count));
            Ok(())
        }
    }

    fn stage(name: &str, max: u32) -> StageDescriptor {
        StageDescriptor {
            name: name.to_string(),
            environment: Environment {
                region: "us-east-1".to_string(),
                account: "1234".to_string(),
            },
            production: false,
            compute_capacity: CapacityBounds::new(1, max),
            task_capacity: CapacityBounds::new(1, max),
            secret_ref: "secret".to_string(),
            health_endpoint: HealthEndpoint {
                address: "127.0.0.1:1".to_string(),
                path: "/health".to_string(),
            },
        }
    }

    fn controller(
        source: FixedUtilization,
        scaler: RecordingScaler,
    ) -> CapacityController<FixedUtilization, RecordingScaler> {
        let pipeline = Pipeline::new("svc", vec![stage("beta", 4), stage("prod", 8)]).unwrap();
        CapacityController::new(
            pipeline,
            CapacityPolicy::default(),
            StateStore::open_in_memory().unwrap(),
            FleetView::new(),
            source,
            scaler,
        )
    }

    #[test]
    fn seed_starts_every_fleet_at_min() {
        let c = controller(FixedUtilization::default(), RecordingScaler::default());
        c.seed().unwrap();
        assert_eq!(c.fleets.sizes("svc", "beta"), (Some(1), Some(1)));
        assert_eq!(c.store.list_scaling().unwrap().len(), 4);
    }

    #[test]
    fn reconcile_writes_through() {
        let c = controller(FixedUtilization::default(), RecordingScaler::default());
        let d = c.reconcile_at("beta", Fleet::Task, 150.0, 1000).unwrap();
        assert_eq!(d.desired, 3);

        let state = c.store.get_scaling("svc", "beta", Fleet::Task).unwrap().unwrap();
        assert_eq!(state.current_count, 3);
        assert_eq!(state.last_scale_out_at, 1000);
        assert_eq!(c.fleets.count("svc", "beta", Fleet::Task), Some(3));
        // The other fleet is untouched.
        assert_eq!(c.fleets.count("svc", "beta", Fleet::Compute), None);
    }

    #[test]
    fn compute_scale_in_cooldown_holds_for_five_minutes() {
        let c = controller(FixedUtilization::default(), RecordingScaler::default());
        c.reconcile_at("beta", Fleet::Compute, 240.0, 1000).unwrap();
        c.reconcile_at("beta", Fleet::Compute, 30.0, 1100).unwrap();

        let held = c.reconcile_at("beta", Fleet::Compute, 10.0, 1200).unwrap();
        assert_eq!(held.reason, ScalingReason::CoolingDown);
        assert_eq!(held.cooldown_until, Some(1400));
    }

    #[test]
    fn unknown_stage_is_rejected() {
        let c = controller(FixedUtilization::default(), RecordingScaler::default());
        assert!(matches!(
            c.reconcile_at("gamma", Fleet::Task, 90.0, 1),
            Err(AutoscaleError::UnknownStage(_))
        ));
    }

    #[test]
    fn persisted_out_of_bounds_count_is_clamped() {
        let c = controller(FixedUtilization::default(), RecordingScaler::default());
        let mut state = ScalingState::new("svc", "beta", Fleet::Task, 9);
        state.last_scale_in_at = 999;
        c.store.put_scaling(&state).unwrap();

        let d = c.reconcile_at("beta", Fleet::Task, 60.0, 1000).unwrap();
        assert_eq!(d.desired, 4);
        assert_eq!(d.reason, ScalingReason::Clamped);
    }

    #[tokio::test]
    async fn tick_scales_fleets_independently() {
        let source = FixedUtilization::default()
            .with("beta", Fleet::Task, 120.0)
            .with("beta", Fleet::Compute, 60.0)
            .with("prod", Fleet::Task, 30.0);
        let scaler = RecordingScaler::default();
        let c = controller(source, scaler.clone());

        let decisions = c.tick_at(1000).await.unwrap();
        assert_eq!(decisions.len(), 3);
        assert_eq!(*scaler.calls.lock().unwrap(), [("beta".to_string(), Fleet::Task, 2)]);
        assert_eq!(c.fleets.sizes("svc", "beta"), (None, Some(2)));
    }

    #[tokio::test]
    async fn failed_scale_call_is_not_recorded() {
        let source = FixedUtilization::default().with("beta", Fleet::Task, 120.0);
        let scaler = RecordingScaler {
            fail: true,
            ..RecordingScaler::default()
        };
        let c = controller(source, scaler);

        let decisions = c.tick_at(1000).await.unwrap();
        assert!(decisions.is_empty());
        let state = c.store.get_scaling("svc", "beta", Fleet::Task).unwrap().unwrap();
        assert_eq!(state.current_count, 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let c = controller(FixedUtilization::default(), RecordingScaler::default());
        let (tx, rx) = tokio::sync::watch::channel(false);

        let handle = tokio::spawn(async move { c.run(Duration::from_millis(5), rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
