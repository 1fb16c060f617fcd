use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tracing::{error, info, warn};

use gateway_sync::config::Config;
use gateway_sync::engine::{RunController, RunMode, RunStatus, SyncSettings};
use gateway_sync::init::{init_gateway, setup_logging};
use gateway_sync::source::{BlocklistSource, HttpBlocklistSource};

#[derive(Parser, Debug)]
#[command(name = "gateway-sync", version, about = "Sync blocklists into Cloudflare Gateway")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Converge Gateway lists and the blocking policy to the blocklists
    Sync {
        /// Delete every managed list and the policy before rebuilding
        #[arg(long)]
        fresh_start: bool,
        /// Plan and log the changes without applying them
        #[arg(long)]
        dry_run: bool,
    },
    /// Delete every managed list and the policy
    Cleanup {
        #[arg(long)]
        dry_run: bool,
    },
    /// Show what a sync would change
    Plan,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(status) => ExitCode::from(status.exit_code() as u8),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("gateway-sync: {:#}", e);
            ExitCode::from(RunStatus::Aborted.exit_code() as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<RunStatus> {
    // 1. Load Config
    let config_found = cli.config.exists();
    let mut config = if config_found {
        Config::load(&cli.config)
            .await
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        Config::default()
    };
    config.apply_env_overrides();

    let mode = match cli.command {
        Command::Sync {
            fresh_start,
            dry_run,
        } => {
            config.sync.dry_run |= dry_run;
            if fresh_start || config.sync.fresh_start {
                RunMode::FreshStart
            } else {
                RunMode::Sync
            }
        }
        Command::Cleanup { dry_run } => {
            config.sync.dry_run |= dry_run;
            RunMode::Teardown
        }
        Command::Plan => {
            config.sync.dry_run = true;
            RunMode::Sync
        }
    };

    // 2. Setup Logging
    setup_logging(&config);
    info!("Starting gateway-sync ({:?})...", mode);
    if !config_found {
        info!("Config file not found, using defaults.");
    }
    config.validate()?;

    // 3. Build desired state before touching the account
    let desired = if mode == RunMode::Teardown {
        BTreeSet::new()
    } else {
        HttpBlocklistSource::new(&config)?.fetch().await?
    };

    // 4. Run
    let gateway = init_gateway(&config)?;
    let controller = RunController::new(gateway, SyncSettings::from_config(&config));

    let report = tokio::select! {
        report = controller.run(&desired, mode) => report,
        _ = signal::ctrl_c() => {
            warn!("Interrupted. Remote state may be partially updated; the next run converges it.");
            return Ok(RunStatus::Aborted);
        }
    };

    report.summary.log();
    Ok(report.summary.status)
}
