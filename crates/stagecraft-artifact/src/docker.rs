//! `ImageBuilder` and `Registry` backed by the `docker` CLI.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use stagecraft_core::config::duration_or;
use stagecraft_core::{SourceRevision, StagecraftConfig};

use crate::error::{BuildFailure, RegistryError};
use crate::resolver::{ImageBuilder, LocalImage, PushReceipt, Registry};

/// Registry stderr fragments that indicate a retry may succeed.
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "tls handshake",
    "too many requests",
    "toomanyrequests",
    "503",
    "502",
    "500 internal server error",
    "eof",
];

#[derive(Debug, Clone)]
pub struct DockerCli {
    /// Registry repository URI images are tagged with.
    pub location: String,
    /// Build context directory.
    pub context: PathBuf,
    pub dockerfile: Option<String>,
    /// e.g. `linux/arm64`.
    pub platform: Option<String>,
    pub build_timeout: Duration,
    pub push_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    /// The binary could not be started.
    Spawn,
    /// Killed after running past its limit.
    TimedOut,
    Exited,
}

#[derive(Debug)]
struct CommandFailure {
    kind: FailureKind,
    message: String,
}

const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(10 * 60);

impl DockerCli {
    pub fn new(location: impl Into<String>, context: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            context: context.into(),
            dockerfile: None,
            platform: None,
            build_timeout: DEFAULT_BUILD_TIMEOUT,
            push_timeout: DEFAULT_PUSH_TIMEOUT,
        }
    }

    pub fn from_config(config: &StagecraftConfig) -> Self {
        Self {
            location: config.registry.location.clone(),
            context: config
                .source
                .checkout
                .as_deref()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            dockerfile: config.registry.dockerfile.clone(),
            platform: config.registry.platform.clone(),
            build_timeout: duration_or(config.registry.build_timeout.as_deref(), DEFAULT_BUILD_TIMEOUT),
            push_timeout: duration_or(config.registry.push_timeout.as_deref(), DEFAULT_PUSH_TIMEOUT),
        }
    }

    /// Per-lookup timeout configured for digest resolution.
    pub fn digest_timeout(config: &StagecraftConfig) -> Duration {
        duration_or(config.registry.digest_timeout.as_deref(), Duration::from_secs(30))
    }

    /// Tag an image for a revision: `location:revision`.
    pub fn tag_for(&self, source: &SourceRevision) -> String {
        format!("{}:{}", self.location, source.revision_id)
    }

    fn build_args(&self, tag: &str) -> Vec<String> {
        let mut args = vec!["build".to_string(), "-t".to_string(), tag.to_string()];
        if let Some(dockerfile) = &self.dockerfile {
            args.push("-f".to_string());
            args.push(dockerfile.clone());
        }
        if let Some(platform) = &self.platform {
            args.push("--platform".to_string());
            args.push(platform.clone());
        }
        args.push(self.context.display().to_string());
        args
    }

    async fn docker(&self, args: &[String], limit: Duration) -> Result<String, CommandFailure> {
        run_bounded("docker", args, limit).await
    }
}

/// Run `program` to completion within `limit`. The child is killed when
/// the limit passes.
async fn run_bounded(program: &str, args: &[String], limit: Duration) -> Result<String, CommandFailure> {
    debug!(%program, ?args, ?limit, "running command");
    let command = args.first().map(String::as_str).unwrap_or_default();
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(limit, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(CommandFailure {
                kind: FailureKind::Spawn,
                message: format!("failed to run {program}: {e}"),
            });
        }
        Err(_) => {
            return Err(CommandFailure {
                kind: FailureKind::TimedOut,
                message: format!("{program} {command} timed out after {limit:?}"),
            });
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CommandFailure {
            kind: FailureKind::Exited,
            message: format!("{program} {command} exited with {}: {}", output.status, last_line(&stderr)),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn last_line(s: &str) -> &str {
    s.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim()
}

/// Classify a failed registry command.
fn classify(message: &str) -> RegistryError {
    let lower = message.to_ascii_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        RegistryError::Transient(message.to_string())
    } else {
        RegistryError::Permanent(message.to_string())
    }
}

fn push_error(failure: CommandFailure) -> RegistryError {
    match failure.kind {
        FailureKind::Spawn => RegistryError::Permanent(failure.message),
        // A stalled upload may go through on the next attempt.
        FailureKind::TimedOut => RegistryError::Transient(failure.message),
        FailureKind::Exited => classify(&failure.message),
    }
}

/// `repo@sha256:…` → `sha256:…`.
fn digest_from_repo_digest(s: &str) -> &str {
    s.rsplit_once('@').map(|(_, d)| d).unwrap_or(s).trim()
}

impl ImageBuilder for DockerCli {
    async fn build(&self, source: &SourceRevision) -> Result<LocalImage, BuildFailure> {
        let tag = self.tag_for(source);
        self.docker(&self.build_args(&tag), self.build_timeout)
            .await
            .map_err(|f| BuildFailure(f.message))?;
        Ok(LocalImage { tag })
    }
}

impl Registry for DockerCli {
    fn location(&self) -> &str {
        &self.location
    }

    async fn push(&self, image: &LocalImage) -> Result<PushReceipt, RegistryError> {
        let args = ["push".to_string(), image.tag.clone()];
        match self.docker(&args, self.push_timeout).await {
            Ok(_) => Ok(PushReceipt {
                tag: image.tag.clone(),
            }),
            Err(f) => Err(push_error(f)),
        }
    }

    async fn resolve_digest(&self, receipt: &PushReceipt) -> Result<String, RegistryError> {
        let args = [
            "inspect".to_string(),
            "--format".to_string(),
            "{{index .RepoDigests 0}}".to_string(),
            receipt.tag.clone(),
        ];
        // The resolver bounds each lookup; this limit only reaps the child.
        match self.docker(&args, self.push_timeout).await {
            Ok(out) if out.is_empty() => Err(RegistryError::Transient(format!(
                "no repo digest recorded for {} yet",
                receipt.tag
            ))),
            Ok(out) => Ok(digest_from_repo_digest(&out).to_string()),
            Err(f) if f.kind == FailureKind::Spawn => Err(RegistryError::Permanent(f.message)),
            Err(f) if f.kind == FailureKind::TimedOut => Err(RegistryError::Transient(f.message)),
            // The digest appears only after the registry acknowledges the push.
            Err(f) if f.message.contains("index out of range") => Err(RegistryError::Transient(f.message)),
            Err(f) => Err(classify(&f.message)),
        }
    }
}
