//! One-shot operator commands run directly against the data directory.
//!
//! These open the state store themselves, so they are meant for a data
//! directory no `serve` process holds. Against a running daemon, use the
//! REST API instead.

use std::path::Path;

use anyhow::bail;

use stagecraft_core::{SourceRevision, StagecraftConfig};
use stagecraft_pipeline::{AbortOutcome, RunOutcome};

use crate::daemon::{Assembly, assemble, open_store};

fn load(config_path: &Path, data_dir: &Path) -> anyhow::Result<Assembly> {
    let config = StagecraftConfig::from_file(config_path)?;
    let store = open_store(data_dir)?;
    assemble(config, store)
}

/// Print where a drive ended. An aborted run is an error so the process
/// exits non-zero.
fn report(run_id: &str, outcome: &RunOutcome) -> anyhow::Result<()> {
    match outcome {
        RunOutcome::Completed => {
            println!("run {run_id} completed");
            Ok(())
        }
        RunOutcome::Suspended { stage } => {
            println!("run {run_id} awaiting approval for stage {stage}");
            println!("  approve with: stagecraftd approve --run {run_id} --stage {stage}");
            Ok(())
        }
        RunOutcome::Aborted { stage, reason } => {
            let stage = stage.as_deref().unwrap_or("-");
            bail!("run {run_id} aborted at stage {stage}: {reason}")
        }
    }
}

/// Start a run for `revision` on the watched branch and drive it.
pub async fn run(config_path: &Path, data_dir: &Path, revision: &str) -> anyhow::Result<()> {
    let assembly = load(config_path, data_dir)?;
    let source = SourceRevision::new(
        assembly.config.source.repository.clone(),
        assembly.config.source.branch.clone(),
        revision,
    );

    let run_id = assembly.sequencer.start(source)?;
    println!("run {run_id} started");
    let outcome = assembly.sequencer.drive(&run_id).await?;
    report(&run_id, &outcome)
}

/// Approve a suspended stage and keep driving.
pub async fn approve(
    config_path: &Path,
    data_dir: &Path,
    run_id: &str,
    stage: &str,
    approved_by: Option<String>,
) -> anyhow::Result<()> {
    let assembly = load(config_path, data_dir)?;
    assembly.sequencer.approve(run_id, stage, approved_by).await?;
    println!("stage {stage} of run {run_id} approved");
    let outcome = assembly.sequencer.drive(run_id).await?;
    report(run_id, &outcome)
}

pub async fn abort(config_path: &Path, data_dir: &Path, run_id: &str, reason: &str) -> anyhow::Result<()> {
    let assembly = load(config_path, data_dir)?;
    match assembly.sequencer.abort(run_id, reason).await? {
        AbortOutcome::Aborted => println!("run {run_id} aborted"),
        AbortOutcome::Requested => println!("abort of run {run_id} requested"),
    }
    Ok(())
}

pub async fn restart(config_path: &Path, data_dir: &Path, run_id: &str) -> anyhow::Result<()> {
    let assembly = load(config_path, data_dir)?;
    let outcome = assembly.sequencer.restart(run_id).await?;
    report(run_id, &outcome)
}

/// Print the run record as JSON.
pub fn status(config_path: &Path, data_dir: &Path, run_id: &str) -> anyhow::Result<()> {
    let assembly = load(config_path, data_dir)?;
    let run = assembly.sequencer.status(run_id)?;
    println!("{}", serde_json::to_string_pretty(&run)?);
    Ok(())
}
