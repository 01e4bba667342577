//! Assembles the subsystems for one pipeline and runs the server.
//!
//! In `serve` mode the daemon:
//! 1. Opens the state store and loads fleet sizes
//! 2. Builds the sequencer (docker resolver, deploy hook, HTTP prober)
//! 3. Resumes every unfinished run
//! 4. Starts steady-state health monitors for released stages
//! 5. Runs the capacity controller when capacity hooks are configured
//! 6. Expires overdue approval gates when an expiry is configured
//! 7. Serves the REST API until Ctrl-C

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use stagecraft_api::{WatchedSource, build_router, spawn_drive};
use stagecraft_artifact::{ArtifactResolver, DockerCli, ResolveArtifact, RetryPolicy};
use stagecraft_autoscale::{CapacityController, CapacityPolicy};
use stagecraft_core::{EventSink, StagecraftConfig, TracingEventSink};
use stagecraft_health::{HealthMonitor, HealthSettings, HttpProber, Prober};
use stagecraft_pipeline::{ApprovalPolicy, Deployer, Sequencer};
use stagecraft_state::{FleetView, StateStore};

use crate::hooks::{CommandDeployer, CommandFleet};

pub type DaemonResolver = ArtifactResolver<DockerCli, DockerCli>;
pub type DaemonSequencer = Sequencer<DaemonResolver, CommandDeployer, HttpProber>;

/// Everything built from one config file.
pub struct Assembly {
    pub config: StagecraftConfig,
    pub store: StateStore,
    pub fleets: FleetView,
    pub sequencer: Arc<DaemonSequencer>,
}

/// Open (or create) the state store under `data_dir`.
pub fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("stagecraft.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

pub fn assemble(config: StagecraftConfig, store: StateStore) -> anyhow::Result<Assembly> {
    let pipeline = config.pipeline()?;
    let fleets = FleetView::load(&store)?;
    let events: Arc<dyn EventSink> = Arc::new(TracingEventSink);

    let docker = DockerCli::from_config(&config);
    let resolver = ArtifactResolver::new(docker.clone(), docker)
        .with_retry(RetryPolicy::from_section(config.retry.as_ref()))
        .with_lookup_timeout(DockerCli::digest_timeout(&config));

    let health = HealthMonitor::new(
        HttpProber,
        HealthSettings::from_section(config.health.as_ref()),
        fleets.clone(),
        events.clone(),
    );

    let approval = config
        .approval_expiry()
        .map(ApprovalPolicy::expiring_after)
        .unwrap_or_default();

    let sequencer = Sequencer::new(
        pipeline,
        store.clone(),
        resolver,
        CommandDeployer::from_config(&config)?,
        health,
        events,
    )
    .with_approval_policy(approval);

    info!(
        pipeline = %config.pipeline.name,
        stages = config.stages.len(),
        "pipeline assembled"
    );

    Ok(Assembly {
        config,
        store,
        fleets,
        sequencer: Arc::new(sequencer),
    })
}

/// How often suspended runs are checked for an expired gate.
fn gate_sweep_interval(expiry: Duration) -> Duration {
    expiry.clamp(Duration::from_secs(1), Duration::from_secs(60))
}

/// Periodically abort runs whose approval gate expired.
async fn sweep_gates<A, D, P>(
    sequencer: Arc<Sequencer<A, D, P>>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    A: ResolveArtifact,
    D: Deployer,
    P: Prober,
{
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sequencer.expire_overdue_gates().await {
                    Ok(expired) => {
                        for (run_id, _) in expired {
                            warn!(%run_id, "approval gate expired, run aborted");
                        }
                    }
                    Err(e) => warn!(error = %e, "approval gate sweep failed"),
                }
            }
            _ = shutdown.changed() => {
                info!("approval gate sweep stopped");
                break;
            }
        }
    }
}

pub async fn serve(
    config_path: PathBuf,
    data_dir: PathBuf,
    port: u16,
    autoscale_interval: u64,
) -> anyhow::Result<()> {
    info!("Stagecraft daemon starting");

    let config = StagecraftConfig::from_file(&config_path)?;
    let store = open_store(&data_dir)?;
    let Assembly {
        config,
        store,
        fleets,
        sequencer,
    } = assemble(config, store)?;
    let pipeline = sequencer.pipeline().clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Resume unfinished runs ─────────────────────────────────

    for run in sequencer.active_runs()? {
        info!(run_id = %run.run_id, status = ?run.status, "resuming run");
        spawn_drive(sequencer.clone(), run.run_id);
    }

    // ── Steady-state health ────────────────────────────────────

    for stage in pipeline.stages() {
        if store.get_release(pipeline.name(), &stage.name)?.is_some() {
            sequencer.health().start_monitor(pipeline.name(), stage).await;
        }
    }

    // ── Capacity controller ────────────────────────────────────

    let autoscale_handle = match CommandFleet::from_config(&config) {
        Some(fleet) => {
            let controller = CapacityController::new(
                pipeline.clone(),
                CapacityPolicy::from_section(config.capacity.as_ref()),
                store.clone(),
                fleets.clone(),
                fleet.clone(),
                fleet,
            );
            controller.seed()?;
            info!(interval = autoscale_interval, "capacity controller initialized");

            let shutdown = shutdown_rx.clone();
            Some(tokio::spawn(async move {
                controller
                    .run(Duration::from_secs(autoscale_interval), shutdown)
                    .await;
            }))
        }
        None => {
            info!("capacity commands not configured, autoscaling disabled");
            None
        }
    };

    // ── Approval expiry ────────────────────────────────────────

    let sweep_handle = sequencer.approval_policy().expires_after.map(|expiry| {
        let every = gate_sweep_interval(expiry);
        info!(?expiry, ?every, "approval gates expire");
        tokio::spawn(sweep_gates(sequencer.clone(), every, shutdown_rx.clone()))
    });

    // ── API server ─────────────────────────────────────────────

    let router = build_router(
        sequencer.clone(),
        WatchedSource {
            repository: config.source.repository.clone(),
            branch: config.source.branch.clone(),
        },
    );
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    sequencer.health().stop_all().await;
    for handle in [autoscale_handle, sweep_handle].into_iter().flatten() {
        let _ = handle.await;
    }

    info!("Stagecraft daemon stopped");
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use stagecraft_core::{ArtifactReference, ContentDigest, SourceRevision};
    use stagecraft_rollout::DeploymentAttempt;
    use stagecraft_state::{RunRecord, RunStatus};

    pub(crate) const CONFIG: &str = r#"
[pipeline]
name = "portal"

[source]
repository = "org/portal"
branch = "main"

[registry]
location = "registry.example.com/portal"

[deploy]
command = ["true"]

[approval]
expires_after = "1h"

[[stages]]
name = "beta"
region = "us-east-1"
account = "123456789012"
secret_ref = "beta/portal/env"
compute_capacity = { min = 1, max = 2 }
task_capacity = { min = 1, max = 2 }
health_endpoint = { address = "127.0.0.1:1" }

[[stages]]
name = "prod"
region = "us-east-1"
account = "123456789012"
production = true
secret_ref = "prod/portal/env"
compute_capacity = { min = 2, max = 4 }
task_capacity = { min = 2, max = 4 }
health_endpoint = { address = "127.0.0.1:1" }
"#;

    #[test]
    fn assembles_from_config() {
        let config = StagecraftConfig::parse(CONFIG).unwrap();
        let assembly = assemble(config, StateStore::open_in_memory().unwrap()).unwrap();

        assert_eq!(assembly.sequencer.pipeline().name(), "portal");
        assert_eq!(assembly.sequencer.pipeline().len(), 2);
        assert_eq!(assembly.sequencer.resolver().registry().location, "registry.example.com/portal");
        assert!(CommandFleet::from_config(&assembly.config).is_none());
    }

    #[test]
    fn deploy_section_is_required() {
        let config = StagecraftConfig::parse(&CONFIG.replace("[deploy]\ncommand = [\"true\"]\n", "")).unwrap();
        let err = assemble(config, StateStore::open_in_memory().unwrap()).err().unwrap();
        assert!(err.to_string().contains("[deploy]"));
    }

    #[test]
    fn sweep_interval_is_clamped() {
        assert_eq!(gate_sweep_interval(Duration::ZERO), Duration::from_secs(1));
        assert_eq!(gate_sweep_interval(Duration::from_secs(10)), Duration::from_secs(10));
        assert_eq!(gate_sweep_interval(Duration::from_secs(72 * 3600)), Duration::from_secs(60));
    }

    /// Single production stage, so a run can sit at its gate without
    /// building or deploying anything.
    fn gated_config(expires_after: &str) -> StagecraftConfig {
        let beta_start = CONFIG.find("[[stages]]\nname = \"beta\"").unwrap();
        let prod_start = CONFIG.find("[[stages]]\nname = \"prod\"").unwrap();
        let text = format!("{}{}", &CONFIG[..beta_start], &CONFIG[prod_start..])
            .replace("expires_after = \"1h\"", &format!("expires_after = \"{expires_after}\""));
        StagecraftConfig::parse(&text).unwrap()
    }

    fn suspended_run(assembly: &Assembly) -> String {
        let pipeline = assembly.sequencer.pipeline().clone();
        let artifact = ArtifactReference::new(
            "registry.example.com/portal",
            ContentDigest::parse("sha256:abc").unwrap(),
        );
        let mut attempt = DeploymentAttempt::new("prod", artifact.clone(), None, 0);
        attempt.await_approval(0).unwrap();

        let mut run = RunRecord::new(
            "run-1".to_string(),
            pipeline,
            SourceRevision::new("org/portal", "main", "abc"),
            0,
        );
        run.artifact = Some(artifact);
        run.status = RunStatus::AwaitingApproval;
        run.attempts.push(attempt);
        assembly.store.put_run(&run).unwrap();
        run.run_id
    }

    #[tokio::test]
    async fn sweep_aborts_expired_gates_until_shutdown() {
        let assembly = assemble(gated_config("0s"), StateStore::open_in_memory().unwrap()).unwrap();
        let run_id = suspended_run(&assembly);

        let (tx, rx) = watch::channel(false);
        let sweeper = tokio::spawn(sweep_gates(
            assembly.sequencer.clone(),
            Duration::from_millis(10),
            rx,
        ));

        let mut status = RunStatus::AwaitingApproval;
        for _ in 0..200 {
            status = assembly.sequencer.status(&run_id).unwrap().status;
            if status == RunStatus::Aborted {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, RunStatus::Aborted);
        let failure = assembly.sequencer.status(&run_id).unwrap().failure.unwrap();
        assert!(failure.reason.contains("expired"));

        tx.send(true).unwrap();
        sweeper.await.unwrap();
    }

    #[tokio::test]
    async fn sweep_leaves_open_gates_alone() {
        let assembly = assemble(gated_config("1h"), StateStore::open_in_memory().unwrap()).unwrap();
        let run_id = suspended_run(&assembly);
        // Suspended just now, not at the epoch.
        let mut run = assembly.store.get_run(&run_id).unwrap().unwrap();
        run.attempts[0].awaiting_since = Some(stagecraft_core::epoch_secs());
        assembly.store.put_run(&run).unwrap();

        let expired = assembly.sequencer.expire_overdue_gates().await.unwrap();
        assert!(expired.is_empty());
        assert_eq!(
            assembly.sequencer.status(&run_id).unwrap().status,
            RunStatus::AwaitingApproval
        );
    }

    #[test]
    fn store_is_created_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("state");
        open_store(&data_dir).unwrap();
        assert!(data_dir.join("stagecraft.redb").exists());
    }
}
