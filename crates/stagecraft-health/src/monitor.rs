//! Health monitor: probes stages and reports verdicts.
//!
//! Two modes:
//!
//! - [`HealthMonitor::observe`] watches one rollout until the tracker
//!   settles or the rollout deadline passes. The sequencer awaits it.
//! - [`HealthMonitor::start_monitor`] spawns a background loop per stage
//!   that keeps probing a released stage and emits an event on every
//!   verdict transition.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use stagecraft_core::{EventKind, EventSink, HealthVerdict, PipelineEvent, StageDescriptor};
use stagecraft_rollout::DeploymentAttempt;
use stagecraft_state::FleetView;

use crate::checker::{HealthTracker, Prober};
use crate::settings::HealthSettings;

/// Per-stage monitor state.
struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Probes stage health endpoints and turns results into verdicts.
pub struct HealthMonitor<P> {
    prober: Arc<P>,
    settings: HealthSettings,
    fleets: FleetView,
    events: Arc<dyn EventSink>,
    /// Background monitors: `{pipeline}/{stage}` → slot.
    monitors: Arc<RwLock<HashMap<String, MonitorSlot>>>,
}

impl<P: Prober> HealthMonitor<P> {
    pub fn new(
        prober: P,
        settings: HealthSettings,
        fleets: FleetView,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            prober: Arc::new(prober),
            settings,
            fleets,
            events,
            monitors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    /// Watch a rollout until it is `Healthy` or `Unhealthy`.
    ///
    /// The first probe runs immediately, then one per `interval`. A rollout
    /// still undecided at `rollout_deadline` is reported `Unhealthy`.
    pub async fn observe(
        &self,
        pipeline: &str,
        run_id: &str,
        stage: &StageDescriptor,
        attempt: &DeploymentAttempt,
    ) -> HealthVerdict {
        let deadline = Instant::now() + self.settings.rollout_deadline;
        let mut tracker = HealthTracker::new(&self.settings);
        let mut last = tracker.verdict();

        info!(
            %run_id,
            stage = %stage.name,
            digest = %attempt.artifact.content_digest,
            "observing rollout"
        );

        loop {
            let result = self.prober.probe(stage, self.settings.timeout).await;
            let verdict = tracker.record(result);
            debug!(%run_id, stage = %stage.name, ?result, ?verdict, "probe recorded");

            if verdict != last {
                self.emit_change(pipeline, Some(run_id), &stage.name, verdict);
                last = verdict;
            }
            if verdict.is_settled() {
                return verdict;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    %run_id,
                    stage = %stage.name,
                    deadline = ?self.settings.rollout_deadline,
                    "rollout deadline passed before stage settled"
                );
                self.emit_change(pipeline, Some(run_id), &stage.name, HealthVerdict::Unhealthy);
                return HealthVerdict::Unhealthy;
            }

            tokio::time::sleep(self.settings.interval.min(deadline - now)).await;
        }
    }

    fn emit_change(&self, pipeline: &str, run_id: Option<&str>, stage: &str, verdict: HealthVerdict) {
        emit_health_changed(self.events.as_ref(), &self.fleets, pipeline, run_id, stage, verdict);
    }

    /// Keep probing a released stage in the background.
    ///
    /// Replaces any monitor already running for the same stage.
    pub async fn start_monitor(&self, pipeline: &str, stage: &StageDescriptor) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let key = monitor_key(pipeline, &stage.name);

        let ctx = LoopContext {
            pipeline: pipeline.to_string(),
            stage: stage.clone(),
            prober: self.prober.clone(),
            settings: self.settings.clone(),
            fleets: self.fleets.clone(),
            events: self.events.clone(),
        };

        let handle = tokio::spawn(async move {
            run_health_loop(ctx, shutdown_rx).await;
        });

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(key, MonitorSlot { handle, shutdown_tx }) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        info!(%pipeline, stage = %stage.name, "health monitor started");
    }

    pub async fn stop_monitor(&self, pipeline: &str, stage: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(&monitor_key(pipeline, stage)) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(%pipeline, %stage, "health monitor stopped");
        }
    }

    /// Stop all monitors (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (key, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(%key, "health monitor stopped");
        }
        info!("all health monitors stopped");
    }

    /// Keys (`pipeline/stage`) with an active background monitor.
    pub async fn active_monitors(&self) -> Vec<String> {
        let monitors = self.monitors.read().await;
        monitors.keys().cloned().collect()
    }

    pub async fn is_monitoring(&self, pipeline: &str, stage: &str) -> bool {
        let monitors = self.monitors.read().await;
        monitors.contains_key(&monitor_key(pipeline, stage))
    }
}

fn monitor_key(pipeline: &str, stage: &str) -> String {
    format!("{pipeline}/{stage}")
}

fn emit_health_changed(
    events: &dyn EventSink,
    fleets: &FleetView,
    pipeline: &str,
    run_id: Option<&str>,
    stage: &str,
    verdict: HealthVerdict,
) {
    let (compute_count, task_count) = fleets.sizes(pipeline, stage);
    events.emit(PipelineEvent::new(
        run_id,
        Some(stage),
        EventKind::HealthChanged {
            verdict,
            compute_count,
            task_count,
        },
    ));
}

struct LoopContext<P> {
    pipeline: String,
    stage: StageDescriptor,
    prober: Arc<P>,
    settings: HealthSettings,
    fleets: FleetView,
    events: Arc<dyn EventSink>,
}

/// Steady-state loop for one released stage.
async fn run_health_loop<P: Prober>(ctx: LoopContext<P>, mut shutdown: watch::Receiver<bool>) {
    let mut tracker = HealthTracker::new(&ctx.settings);
    debug!(pipeline = %ctx.pipeline, stage = %ctx.stage.name, "health loop starting");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(ctx.settings.interval) => {
                let result = ctx.prober.probe(&ctx.stage, ctx.settings.timeout).await;
                let prev = tracker.verdict();
                let verdict = tracker.record(result);

                if verdict != prev {
                    emit_health_changed(
                        ctx.events.as_ref(),
                        &ctx.fleets,
                        &ctx.pipeline,
                        None,
                        &ctx.stage.name,
                        verdict,
                    );
                }
            }
            _ = shutdown.changed() => {
                debug!(pipeline = %ctx.pipeline, stage = %ctx.stage.name, "health loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use stagecraft_core::{
        ArtifactReference, CapacityBounds, ContentDigest, Environment, Fleet, HealthEndpoint,
        MemoryEventSink,
    };
    use stagecraft_state::ScalingState;

    use crate::checker::ProbeResult;

    /// Returns scripted results, then `fallback` forever.
    struct ScriptedProber {
        script: Mutex<VecDeque<ProbeResult>>,
        fallback: ProbeResult,
        calls: Mutex<u32>,
    }

    impl ScriptedProber {
        fn new(script: &[ProbeResult], fallback: ProbeResult) -> Self {
            Self {
                script: Mutex::new(script.iter().copied().collect()),
                fallback,
                calls: Mutex::new(0),
            }
        }
    }

    impl Prober for ScriptedProber {
        async fn probe(&self, _stage: &StageDescriptor, _timeout: Duration) -> ProbeResult {
            *self.calls.lock().unwrap() += 1;
            self.script.lock().unwrap().pop_front().unwrap_or(self.fallback)
        }
    }

    fn stage() -> StageDescriptor {
        StageDescriptor {
            name: "beta".to_string(),
            environment: Environment {
                region: "us-east-1".to_string(),
                account: "1234".to_string(),
            },
            production: false,
            compute_capacity: CapacityBounds::new(1, 2),
            task_capacity: CapacityBounds::new(1, 2),
            secret_ref: "secret".to_string(),
            health_endpoint: HealthEndpoint {
                address: "127.0.0.1:1".to_string(),
                path: "/health".to_string(),
            },
        }
    }

    fn attempt() -> DeploymentAttempt {
        let artifact =
            ArtifactReference::new("registry/app", ContentDigest::parse("sha256:abc").unwrap());
        DeploymentAttempt::new("beta", artifact, None, 1)
    }

    fn fast_settings() -> HealthSettings {
        HealthSettings {
            interval: Duration::ZERO,
            timeout: Duration::from_millis(10),
            rollout_deadline: Duration::from_secs(5),
            ..HealthSettings::default()
        }
    }

    fn monitor(
        prober: ScriptedProber,
        settings: HealthSettings,
    ) -> (HealthMonitor<ScriptedProber>, MemoryEventSink, FleetView) {
        let sink = MemoryEventSink::new();
        let fleets = FleetView::new();
        let m = HealthMonitor::new(prober, settings, fleets.clone(), Arc::new(sink.clone()));
        (m, sink, fleets)
    }

    #[tokio::test]
    async fn observe_settles_healthy_after_threshold() {
        let (m, sink, _) = monitor(
            ScriptedProber::new(&[], ProbeResult::Healthy),
            fast_settings(),
        );
        let verdict = m.observe("svc", "run-1", &stage(), &attempt()).await;

        assert_eq!(verdict, HealthVerdict::Healthy);
        assert_eq!(*m.prober.calls.lock().unwrap(), 3);
        assert_eq!(sink.names(), ["health_changed"]);
    }

    #[tokio::test]
    async fn observe_settles_unhealthy_after_threshold() {
        let (m, _, _) = monitor(
            ScriptedProber::new(&[ProbeResult::Healthy], ProbeResult::Failed),
            fast_settings(),
        );
        let verdict = m.observe("svc", "run-1", &stage(), &attempt()).await;

        assert_eq!(verdict, HealthVerdict::Unhealthy);
        assert_eq!(*m.prober.calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn observe_flapping_hits_deadline() {
        let flapping = [ProbeResult::Healthy, ProbeResult::Failed].repeat(1000);
        let settings = HealthSettings {
            interval: Duration::from_millis(5),
            rollout_deadline: Duration::from_millis(60),
            ..fast_settings()
        };
        let (m, sink, _) = monitor(ScriptedProber::new(&flapping, ProbeResult::Healthy), settings);

        let verdict = m.observe("svc", "run-1", &stage(), &attempt()).await;
        assert_eq!(verdict, HealthVerdict::Unhealthy);
        assert_eq!(sink.names(), ["health_changed"]);
    }

    #[tokio::test]
    async fn health_changed_carries_fleet_sizes() {
        let (m, sink, fleets) = monitor(
            ScriptedProber::new(&[], ProbeResult::Healthy),
            fast_settings(),
        );
        fleets.record(ScalingState::new("svc", "beta", Fleet::Compute, 2));
        fleets.record(ScalingState::new("svc", "beta", Fleet::Task, 1));

        m.observe("svc", "run-1", &stage(), &attempt()).await;

        let events = sink.events();
        assert_eq!(events[0].run_id.as_deref(), Some("run-1"));
        assert_eq!(
            events[0].kind,
            EventKind::HealthChanged {
                verdict: HealthVerdict::Healthy,
                compute_count: Some(2),
                task_count: Some(1),
            }
        );
    }

    #[tokio::test]
    async fn background_monitor_emits_transitions() {
        let settings = HealthSettings {
            interval: Duration::from_millis(1),
            ..fast_settings()
        };
        let (m, sink, _) = monitor(ScriptedProber::new(&[], ProbeResult::Failed), settings);

        m.start_monitor("svc", &stage()).await;
        assert!(m.is_monitoring("svc", "beta").await);

        for _ in 0..200 {
            if !sink.events().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        m.stop_monitor("svc", "beta").await;

        let events = sink.events();
        assert!(!events.is_empty());
        assert!(events[0].run_id.is_none());
        assert!(matches!(
            events[0].kind,
            EventKind::HealthChanged { verdict: HealthVerdict::Unhealthy, .. }
        ));
    }

    #[tokio::test]
    async fn start_replaces_and_stop_all_clears() {
        let (m, _, _) = monitor(
            ScriptedProber::new(&[], ProbeResult::Healthy),
            HealthSettings::default(),
        );

        m.start_monitor("svc", &stage()).await;
        m.start_monitor("svc", &stage()).await;
        assert_eq!(m.active_monitors().await, ["svc/beta"]);

        m.stop_all().await;
        assert!(m.active_monitors().await.is_empty());
    }
}
