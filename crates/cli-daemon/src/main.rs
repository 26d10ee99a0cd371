//! CLI entry point for the VTS batch daemon
//!
//! Parses command line arguments, installs logging and starts the daemon.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vts_batch_daemon::{Config, Daemon};

/// VTS Batch - convert DVD title sets to MP4 with resume support
#[derive(Parser, Debug)]
#[command(name = "vts-batch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml); defaults apply if absent
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Address for the HTTP API, overrides server.bind_addr
    #[arg(short, long)]
    bind: Option<String>,

    /// Skip the ffmpeg/ffprobe availability check. For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(config = %args.config.display(), "VTS batch daemon starting");

    let mut config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }

    let daemon_result = if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
        Ok(Daemon::new_without_checks(config))
    } else {
        Daemon::with_config(config)
    };

    let daemon = match daemon_result {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "failed to initialize daemon");
            return ExitCode::FAILURE;
        }
    };

    info!(
        encoder_threads = daemon.concurrency_plan.encoder_threads,
        "serving API on http://{}/api",
        daemon.config.server.bind_addr
    );

    if let Err(e) = daemon.run_with_server().await {
        error!(error = %e, "daemon error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
