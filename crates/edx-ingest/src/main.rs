//! EDX Ingest - energy data extraction tool

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use edx_common::logging::{init_logging, LogConfig, LogLevel};
use edx_common::RegionCode;
use edx_ingest::consolidate::Scope;
use edx_ingest::discovery;
use edx_ingest::ledger::{rebuild_from_manifests, FileLedger, Ledger};
use edx_ingest::pipeline::region_builder;
use edx_ingest::{FreshnessTracker, Orchestrator, PipelineConfig};
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "edx-ingest")]
#[command(author, version, about = "EDX energy data ingestion tool")]
struct Cli {
    /// Pipeline configuration file
    #[arg(short, long, global = true, env = "EDX_CONFIG", default_value = "config/regions.toml")]
    config: PathBuf,

    /// Processing date (defaults to today)
    #[arg(long, global = true)]
    date: Option<NaiveDate>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover, fetch and consolidate new or revised artifacts
    Run {
        /// Only run these regions (repeatable)
        #[arg(short, long = "region")]
        regions: Vec<RegionCode>,

        /// Override every region's retention horizon
        #[arg(long)]
        horizon_days: Option<u32>,

        /// Also write the JSON run report to this file
        #[arg(long)]
        report: Option<PathBuf>,

        /// Skip the global master dataset
        #[arg(long)]
        no_global: bool,
    },

    /// List a region's artifacts and whether they would be processed
    Discover {
        #[arg(short, long)]
        region: RegionCode,
    },

    /// Rebuild a region's ledger from the manifests in the object store
    RebuildLedger {
        #[arg(short, long)]
        region: RegionCode,
    },

    /// Rebuild master datasets from the local station partitions
    Consolidate {
        /// Only this region; without it every region plus the global dataset
        #[arg(short, long)]
        region: Option<RegionCode>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DiscoveredArtifact {
    name: String,
    url: String,
    window_start: NaiveDate,
    window_end: NaiveDate,
    revision: Option<u32>,
    identity: String,
    freshness: &'static str,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("edx-ingest".to_string())
        .build();

    // Merge with environment variables (they take precedence)
    let log_config = log_config.clone().with_env_overrides().unwrap_or(log_config);
    let _guard = init_logging(&log_config)?;

    let config = PipelineConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?
        .with_env_overrides()?;
    let today = cli.date.unwrap_or_else(|| chrono::Local::now().date_naive());

    match cli.command {
        Command::Run {
            regions,
            horizon_days,
            report,
            no_global,
        } => {
            let mut config = config;
            if let Some(days) = horizon_days {
                for region in &mut config.regions {
                    region.horizon_days = days;
                }
            }
            config.validate()?;

            let orchestrator = Orchestrator::from_config(&config)
                .await?
                .only(&regions)?
                .with_global_master(config.build_global_master && !no_global);

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted; cancelling regions");
                    on_signal.cancel();
                }
            });

            let run = orchestrator.run(today, cancel).await;
            let json = serde_json::to_string_pretty(&run)?;
            if let Some(path) = report {
                std::fs::write(&path, &json)
                    .with_context(|| format!("Failed to write report to {}", path.display()))?;
                info!(path = %path.display(), "Run report written");
            }
            println!("{}", json);

            if run.has_fatal() {
                process::exit(1);
            }
        },

        Command::Discover { region } => {
            config.validate()?;
            let descriptor = config
                .region(&region)
                .ok_or_else(|| anyhow!("region {} is not configured", region))?;
            let orchestrator = Orchestrator::from_config(&config).await?;
            let ledger: Arc<dyn Ledger> = Arc::new(FileLedger::new(config.state_dir.join("ledger")));
            let tracker =
                FreshnessTracker::open(ledger, &region, orchestrator.limits().fingerprint()).await?;

            let artifacts =
                discovery::discover(descriptor, orchestrator.context().remote.clone(), today).await?;
            let listing: Vec<DiscoveredArtifact> = artifacts
                .iter()
                .map(|a| DiscoveredArtifact {
                    name: a.name.clone(),
                    url: a.url.to_string(),
                    window_start: a.window.start,
                    window_end: a.window.end,
                    revision: a.revision,
                    identity: a.identity().key(),
                    freshness: tracker.assess(a).label(),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&listing)?);
        },

        Command::RebuildLedger { region } => {
            config.validate()?;
            if config.region(&region).is_none() {
                return Err(anyhow!("region {} is not configured", region));
            }
            let orchestrator = Orchestrator::from_config(&config).await?;
            let ctx = orchestrator.context();
            let state = rebuild_from_manifests(ctx.store.as_ref(), &ctx.paths, &region).await?;
            ctx.ledger.store(&state).await?;
            info!(region = %region, entries = state.entries.len(), "Ledger rebuilt");
        },

        Command::Consolidate { region } => {
            config.validate()?;
            let orchestrator = Orchestrator::from_config(&config).await?;
            let ctx = orchestrator.context();
            let descriptors: Vec<_> = match &region {
                Some(code) => vec![config
                    .region(code)
                    .ok_or_else(|| anyhow!("region {} is not configured", code))?],
                None => config.regions.iter().collect(),
            };

            for descriptor in descriptors {
                let partitions = ctx.partitions(&descriptor.region).load_all()?;
                let scope = Scope::Region(descriptor.region.clone());
                let location = ctx
                    .publish_master(&partitions, &scope, &region_builder(descriptor), today)
                    .await?;
                println!("{}: {}", descriptor.region, location.as_deref().unwrap_or("no rows"));
            }
            if region.is_none() {
                let location = orchestrator.publish_global_master(today).await?;
                println!(
                    "{}: {}",
                    Scope::Global.label(),
                    location.as_deref().unwrap_or("no rows")
                );
            }
        },
    }

    Ok(())
}
