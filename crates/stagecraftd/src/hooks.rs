//! Platform hooks backed by external commands.
//!
//! Deploying to a stage and resizing its fleets is delegated to
//! operator-provided commands. Each command runs with `STAGECRAFT_*`
//! environment variables describing the target.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, bail};
use tokio::process::Command;
use tracing::{debug, info};

use stagecraft_autoscale::{FleetScaler, UtilizationSource};
use stagecraft_core::config::duration_or;
use stagecraft_core::{ArtifactReference, Fleet, StageDescriptor, StagecraftConfig};
use stagecraft_pipeline::Deployer;

pub const DEFAULT_DEPLOY_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_CAPACITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Environment describing a stage.
fn stage_env(pipeline: &str, stage: &StageDescriptor) -> Vec<(&'static str, String)> {
    vec![
        ("STAGECRAFT_PIPELINE", pipeline.to_string()),
        ("STAGECRAFT_STAGE", stage.name.clone()),
        ("STAGECRAFT_REGION", stage.environment.region.clone()),
        ("STAGECRAFT_ACCOUNT", stage.environment.account.clone()),
        ("STAGECRAFT_SECRET_REF", stage.secret_ref.clone()),
        ("STAGECRAFT_PRODUCTION", stage.production.to_string()),
    ]
}

/// Run `command` with `env` added, returning trimmed stdout. The child is
/// killed if it is still running after `limit`.
async fn run_hook(
    command: &[String],
    env: &[(&'static str, String)],
    limit: Duration,
) -> anyhow::Result<String> {
    let Some((program, args)) = command.split_first() else {
        bail!("hook command is empty");
    };
    debug!(%program, ?args, ?limit, "running hook");

    let child = Command::new(program)
        .args(args)
        .envs(env.iter().map(|(k, v)| (*k, v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();
    let Ok(output) = tokio::time::timeout(limit, child).await else {
        bail!("{program} timed out after {limit:?}");
    };
    let output = output.with_context(|| format!("failed to run {program}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
        bail!("{program} exited with {}: {detail}", output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Deploys by running the `[deploy] command`.
///
/// Adds `STAGECRAFT_IMAGE` (`location@digest`) and `STAGECRAFT_DIGEST`.
#[derive(Debug, Clone)]
pub struct CommandDeployer {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandDeployer {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            timeout: DEFAULT_DEPLOY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn from_config(config: &StagecraftConfig) -> anyhow::Result<Self> {
        match &config.deploy {
            Some(deploy) if !deploy.command.is_empty() => Ok(Self::new(deploy.command.clone())
                .with_timeout(duration_or(deploy.timeout.as_deref(), DEFAULT_DEPLOY_TIMEOUT))),
            _ => bail!("[deploy] command is required"),
        }
    }
}

impl Deployer for CommandDeployer {
    async fn deploy(
        &self,
        pipeline: &str,
        stage: &StageDescriptor,
        artifact: &ArtifactReference,
    ) -> anyhow::Result<()> {
        let mut env = stage_env(pipeline, stage);
        env.push(("STAGECRAFT_IMAGE", artifact.pull_ref()));
        env.push(("STAGECRAFT_DIGEST", artifact.content_digest.to_string()));

        info!(stage = %stage.name, digest = %artifact.content_digest, "deploying");
        run_hook(&self.command, &env, self.timeout).await?;
        Ok(())
    }
}

/// Reads utilization and resizes fleets through the capacity commands.
#[derive(Debug, Clone)]
pub struct CommandFleet {
    utilization: Vec<String>,
    scale: Vec<String>,
}

impl CommandFleet {
    pub fn new(utilization: Vec<String>, scale: Vec<String>) -> Self {
        Self { utilization, scale }
    }

    /// `None` unless both capacity commands are configured.
    pub fn from_config(config: &StagecraftConfig) -> Option<Self> {
        let capacity = config.capacity.as_ref()?;
        match (&capacity.utilization_command, &capacity.scale_command) {
            (Some(u), Some(s)) if !u.is_empty() && !s.is_empty() => Some(Self::new(u.clone(), s.clone())),
            _ => None,
        }
    }
}

impl UtilizationSource for CommandFleet {
    async fn cpu_utilization(
        &self,
        pipeline: &str,
        stage: &StageDescriptor,
        fleet: Fleet,
    ) -> anyhow::Result<Option<f64>> {
        let mut env = stage_env(pipeline, stage);
        env.push(("STAGECRAFT_FLEET", fleet.to_string()));

        let out = run_hook(&self.utilization, &env, DEFAULT_CAPACITY_TIMEOUT).await?;
        if out.is_empty() {
            return Ok(None);
        }
        let cpu = out
            .parse::<f64>()
            .with_context(|| format!("utilization command printed {out:?}, expected a percentage"))?;
        Ok(Some(cpu))
    }
}

impl FleetScaler for CommandFleet {
    async fn scale_to(
        &self,
        pipeline: &str,
        stage: &StageDescriptor,
        fleet: Fleet,
        count: u32,
    ) -> anyhow::Result<()> {
        let mut env = stage_env(pipeline, stage);
        env.push(("STAGECRAFT_FLEET", fleet.to_string()));
        env.push(("STAGECRAFT_COUNT", count.to_string()));

        run_hook(&self.scale, &env, DEFAULT_CAPACITY_TIMEOUT).await?;
        Ok(())
    }
}
