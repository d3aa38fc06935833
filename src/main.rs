//! qemu-fleet: QEMU fleet launcher
//!
//! Reads the fleet configuration, creates the declared host bridges and runs
//! one QEMU process per machine until all of them exit. Ctrl-C kills the
//! running QEMU processes and removes their scratch directories.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use qemu_fleet::command::{DryRunRunner, HostRunner, ProcessRunner};
use qemu_fleet::config::FleetConfig;
use qemu_fleet::logging;
use qemu_fleet::paths::FleetPaths;
use qemu_fleet::supervisor::Supervisor;
use qemu_fleet::vm::image::DryRunFetcher;
use qemu_fleet::vm::{HttpFetcher, ImageFetcher, Launcher, NetworkManager};

/// Launch a fleet of QEMU virtual machines
#[derive(Parser, Debug)]
#[command(name = "qemu-fleet", version, about = "Launch a fleet of QEMU virtual machines")]
struct Args {
    /// Configuration file (TOML, or YAML by extension) [default: ~/.config/qemu-fleet/fleet.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only launch this machine (repeatable)
    #[arg(short, long = "machine")]
    machines: Vec<String>,

    /// Print the commands that would run instead of running them
    #[arg(long)]
    dry_run: bool,

    /// Directory for per-VM scratch directories [default: ~/.cache/qemu-fleet/scratch]
    #[arg(long)]
    scratch_root: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _log_guard = logging::init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    info!("qemu-fleet v{}", env!("CARGO_PKG_VERSION"));

    let paths = FleetPaths::resolve();
    let config_path = match args.config {
        Some(path) => path,
        None => paths
            .as_ref()
            .map(FleetPaths::config_file)
            .context("HOME is not set; pass --config")?,
    };
    let config = FleetConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    info!(
        config = %config_path.display(),
        machines = config.machines.len(),
        networks = config.networks.len(),
        "configuration loaded"
    );

    let scratch_root = match args.scratch_root {
        Some(dir) => Some(dir),
        None => match &paths {
            Some(paths) => {
                paths.ensure().context("failed to create qemu-fleet directories")?;
                Some(paths.cache.join("scratch"))
            }
            None => None,
        },
    };
    if let Some(dir) = &scratch_root {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create scratch root {}", dir.display()))?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping virtual machines");
            let _ = shutdown_tx.send(true);
        }
    });

    let (runner, fetcher): (Arc<dyn ProcessRunner>, Arc<dyn ImageFetcher>) = if args.dry_run {
        info!("dry run: commands are logged, not executed");
        (Arc::new(DryRunRunner), Arc::new(DryRunFetcher))
    } else {
        (
            Arc::new(HostRunner::new(shutdown_rx)),
            Arc::new(HttpFetcher::new()?),
        )
    };

    let networks = Arc::new(NetworkManager::new(Arc::clone(&runner)));
    let mut launcher = Launcher::new(&config, Arc::clone(&networks), runner, fetcher);
    if let Some(root) = scratch_root {
        launcher = launcher.with_scratch_root(root);
    }

    let report = Supervisor::new(networks, Arc::new(launcher))
        .run(&config, &args.machines)
        .await?;

    info!(
        succeeded = report.succeeded().len(),
        failed = report.failed().len(),
        "fleet finished"
    );
    Ok(report.exit_code())
}
