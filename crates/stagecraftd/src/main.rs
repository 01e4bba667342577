//! stagecraftd — the Stagecraft daemon.
//!
//! Single binary that assembles the release orchestrator for one pipeline:
//! - State store (redb)
//! - Artifact resolver (docker build / push / digest lookup)
//! - Pipeline sequencer with approval gates
//! - Health monitor and rollback breaker
//! - Capacity controller
//! - REST API
//!
//! # Usage
//!
//! ```text
//! stagecraftd serve --config stagecraft.toml --port 8443 --data-dir /var/lib/stagecraft
//! stagecraftd run --revision 3f2c1a
//! stagecraftd approve --run <id> --stage prod
//! ```

mod commands;
mod daemon;
mod hooks;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stagecraftd", about = "Stagecraft release orchestrator")]
struct Cli {
    /// Log as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the REST API and drive runs in the background.
    Serve {
        /// Pipeline configuration file.
        #[arg(long, default_value = "stagecraft.toml")]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/stagecraft")]
        data_dir: PathBuf,

        /// Port to listen on.
        #[arg(long, default_value = "8443")]
        port: u16,

        /// Capacity controller interval in seconds.
        #[arg(long, default_value = "60")]
        autoscale_interval: u64,
    },

    /// Start a run for a revision of the watched branch and drive it.
    Run {
        #[arg(long, default_value = "stagecraft.toml")]
        config: PathBuf,

        #[arg(long, default_value = "/var/lib/stagecraft")]
        data_dir: PathBuf,

        /// Revision (commit) to build.
        #[arg(long)]
        revision: String,
    },

    /// Approve a stage that is awaiting approval, then continue the run.
    Approve {
        #[arg(long, default_value = "stagecraft.toml")]
        config: PathBuf,

        #[arg(long, default_value = "/var/lib/stagecraft")]
        data_dir: PathBuf,

        #[arg(long)]
        run: String,

        #[arg(long)]
        stage: String,

        /// Who approved, recorded with the approval.
        #[arg(long)]
        approved_by: Option<String>,
    },

    /// Abort a run.
    Abort {
        #[arg(long, default_value = "stagecraft.toml")]
        config: PathBuf,

        #[arg(long, default_value = "/var/lib/stagecraft")]
        data_dir: PathBuf,

        #[arg(long)]
        run: String,

        #[arg(long, default_value = "aborted by operator")]
        reason: String,
    },

    /// Restart an aborted run from its failing stage.
    Restart {
        #[arg(long, default_value = "stagecraft.toml")]
        config: PathBuf,

        #[arg(long, default_value = "/var/lib/stagecraft")]
        data_dir: PathBuf,

        #[arg(long)]
        run: String,
    },

    /// Print a run record.
    Status {
        #[arg(long, default_value = "stagecraft.toml")]
        config: PathBuf,

        #[arg(long, default_value = "/var/lib/stagecraft")]
        data_dir: PathBuf,

        #[arg(long)]
        run: String,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,stagecraftd=debug,stagecraft=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Command::Serve {
            config,
            data_dir,
            port,
            autoscale_interval,
        } => daemon::serve(config, data_dir, port, autoscale_interval).await,
        Command::Run {
            config,
            data_dir,
            revision,
        } => commands::run(&config, &data_dir, &revision).await,
        Command::Approve {
            config,
            data_dir,
            run,
            stage,
            approved_by,
        } => commands::approve(&config, &data_dir, &run, &stage, approved_by).await,
        Command::Abort {
            config,
            data_dir,
            run,
            reason,
        } => commands::abort(&config, &data_dir, &run, &reason).await,
        Command::Restart {
            config,
            data_dir,
            run,
        } => commands::restart(&config, &data_dir, &run).await,
        Command::Status {
            config,
            data_dir,
            run,
        } => commands::status(&config, &data_dir, &run),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults() {
        let cli = Cli::try_parse_from(["stagecraftd", "serve"]).unwrap();
        assert!(!cli.json);
        match cli.command {
            Command::Serve {
                config,
                port,
                autoscale_interval,
                ..
            } => {
                assert_eq!(config, PathBuf::from("stagecraft.toml"));
                assert_eq!(port, 8443);
                assert_eq!(autoscale_interval, 60);
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn approve_requires_run_and_stage() {
        assert!(Cli::try_parse_from(["stagecraftd", "approve", "--run", "r1"]).is_err());

        let cli = Cli::try_parse_from([
            "stagecraftd",
            "approve",
            "--run",
            "r1",
            "--stage",
            "prod",
            "--approved-by",
            "alice",
            "--json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Command::Approve {
                run,
                stage,
                approved_by,
                ..
            } => {
                assert_eq!(run, "r1");
                assert_eq!(stage, "prod");
                assert_eq!(approved_by.as_deref(), Some("alice"));
            }
            _ => panic!("expected approve"),
        }
    }

    #[test]
    fn run_requires_revision() {
        assert!(Cli::try_parse_from(["stagecraftd", "run"]).is_err());
        assert!(Cli::try_parse_from(["stagecraftd", "run", "--revision", "3f2c1a"]).is_ok());
    }
}
