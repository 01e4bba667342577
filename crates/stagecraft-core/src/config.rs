//! stagecraft.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;
use crate::stage::{CapacityBounds, Environment, HealthEndpoint, Pipeline, PipelineError, StageDescriptor};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagecraftConfig {
    pub pipeline: PipelineSection,
    pub source: SourceSection,
    pub registry: RegistrySection,
    pub deploy: Option<DeploySection>,
    pub health: Option<HealthSection>,
    pub capacity: Option<CapacitySection>,
    pub approval: Option<ApprovalSection>,
    pub retry: Option<RetrySection>,
    #[serde(default)]
    pub stages: Vec<StageEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    pub name: String,
}

/// The repository and branch whose pushes start a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSection {
    pub repository: String,
    pub branch: String,
    /// Local checkout used as the build context.
    pub checkout: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySection {
    /// Repository URI, e.g. `1234.dkr.ecr.us-east-1.amazonaws.com/portal-repo`.
    pub location: String,
    pub dockerfile: Option<String>,
    /// Target platform passed to the builder, e.g. `linux/arm64`.
    pub platform: Option<String>,
    /// Per-lookup timeout for digest resolution.
    pub digest_timeout: Option<String>,
    /// Limit on one image build.
    pub build_timeout: Option<String>,
    /// Limit on one push attempt.
    pub push_timeout: Option<String>,
}

/// External command that rolls an image out to a stage.
///
/// Run with `STAGECRAFT_*` environment variables describing the stage and
/// the image. Must be idempotent for the same image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploySection {
    pub command: Vec<String>,
    /// Limit on one invocation. A deploy still running is killed and
    /// counts as failed.
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthSection {
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub healthy_threshold: Option<u32>,
    pub unhealthy_threshold: Option<u32>,
    /// Upper bound on how long a rollout may take to become healthy.
    pub rollout_deadline: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapacitySection {
    /// Target CPU utilization in percent.
    pub target_cpu: Option<f64>,
    pub compute: Option<CooldownSection>,
    pub task: Option<CooldownSection>,
    /// Prints the fleet's average CPU percent on stdout.
    pub utilization_command: Option<Vec<String>>,
    /// Sets a fleet's desired count.
    pub scale_command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CooldownSection {
    pub scale_out_cooldown: Option<String>,
    pub scale_in_cooldown: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalSection {
    /// How long a stage may wait for approval before the run fails.
    /// Absent means wait indefinitely.
    pub expires_after: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrySection {
    pub max_attempts: Option<u32>,
    pub initial_backoff: Option<String>,
    pub max_backoff: Option<String>,
}

/// A `[[stages]]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEntry {
    pub name: String,
    pub region: String,
    pub account: String,
    #[serde(default)]
    pub production: bool,
    pub secret_ref: String,
    pub compute_capacity: CapacityBounds,
    pub task_capacity: CapacityBounds,
    pub health_endpoint: HealthEndpoint,
}

impl From<StageEntry> for StageDescriptor {
    fn from(e: StageEntry) -> Self {
        StageDescriptor {
            name: e.name,
            environment: Environment {
                region: e.region,
                account: e.account,
            },
            production: e.production,
            compute_capacity: e.compute_capacity,
            task_capacity: e.task_capacity,
            secret_ref: e.secret_ref,
            health_endpoint: e.health_endpoint,
        }
    }
}

impl StagecraftConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: StagecraftConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Build the immutable pipeline described by `[[stages]]`.
    pub fn pipeline(&self) -> Result<Pipeline, PipelineError> {
        let stages = self.stages.iter().cloned().map(StageDescriptor::from).collect();
        Pipeline::new(self.pipeline.name.clone(), stages)
    }

    pub fn approval_expiry(&self) -> Option<Duration> {
        self.approval
            .as_ref()
            .and_then(|a| a.expires_after.as_deref())
            .and_then(parse_duration)
    }
}

/// Parse an optional duration string, falling back to `default`.
pub fn duration_or(value: Option<&str>, default: Duration) -> Duration {
    value.and_then(parse_duration).unwrap_or(default)
}
