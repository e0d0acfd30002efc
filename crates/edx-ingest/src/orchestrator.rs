//! Multi-region orchestration
//!
//! Every region runs as its own tokio task with a wall clock budget and a
//! child cancellation token, so a slow or failing region never holds up the
//! others. The global master dataset is built once all regions are done.

use chrono::NaiveDate;
use edx_common::RegionCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::archive::ArchiveLimits;
use crate::config::{PipelineConfig, SourceDescriptor};
use crate::consolidate::{ConsolidatedDatasetBuilder, Scope};
use crate::error::{IngestError, Result};
use crate::ledger::{FileLedger, Ledger};
use crate::pipeline::{PipelineContext, RegionPipeline, RegionReport};
use crate::remote::{HttpRemote, RemoteSource};
use crate::stations::StationDirectory;
use crate::storage::{open_store, ObjectPaths, ObjectStore};

/// Structured result of one invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: Uuid,
    pub regions: Vec<RegionReport>,
    pub global_master_location: Option<String>,
}

impl RunReport {
    /// True when any region stopped on a fatal error
    ///
    /// Timeouts and cancellations are not fatal; see [`RunReport::interrupted`].
    pub fn has_fatal(&self) -> bool {
        self.regions.iter().any(|r| r.fatal_error.is_some())
    }

    /// Regions cut short by cancellation or their time budget
    pub fn interrupted(&self) -> impl Iterator<Item = &RegionReport> {
        self.regions.iter().filter(|r| r.interrupted.is_some())
    }
}

pub struct Orchestrator {
    ctx: PipelineContext,
    regions: Vec<SourceDescriptor>,
    region_timeout: Duration,
    build_global_master: bool,
}

impl Orchestrator {
    /// Wire the production collaborators from configuration
    pub async fn from_config(config: &PipelineConfig) -> Result<Self> {
        let remote: Arc<dyn RemoteSource> = Arc::new(HttpRemote::new(&config.http, config.retry.clone())?);
        let store = open_store(&config.storage).await?;
        let ledger: Arc<dyn Ledger> = Arc::new(FileLedger::new(config.state_dir.join("ledger")));
        let ctx = PipelineContext {
            remote,
            store,
            ledger,
            paths: ObjectPaths::new(config.storage.prefix.clone()),
            retry: config.retry.clone(),
            limits: config.archive,
            state_dir: config.state_dir.clone(),
            recover_ledger: config.recover_ledger_from_manifests,
        };
        Ok(Self::new(ctx, config))
    }

    pub fn new(ctx: PipelineContext, config: &PipelineConfig) -> Self {
        Self {
            ctx,
            regions: config.regions.clone(),
            region_timeout: Duration::from_secs(config.region_timeout_secs),
            build_global_master: config.build_global_master,
        }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.ctx.store.clone()
    }

    pub fn limits(&self) -> &ArchiveLimits {
        &self.ctx.limits
    }

    /// Restrict the run to the named regions
    pub fn only(mut self, regions: &[RegionCode]) -> Result<Self> {
        if regions.is_empty() {
            return Ok(self);
        }
        for code in regions {
            if !self.regions.iter().any(|d| &d.region == code) {
                return Err(IngestError::Config(format!("region {} is not configured", code)));
            }
        }
        self.regions.retain(|d| regions.contains(&d.region));
        Ok(self)
    }

    pub fn with_global_master(mut self, enabled: bool) -> Self {
        self.build_global_master = enabled;
        self
    }

    pub fn descriptor(&self, code: &RegionCode) -> Option<&SourceDescriptor> {
        self.regions.iter().find(|d| &d.region == code)
    }

    pub fn pipeline(&self, descriptor: &SourceDescriptor) -> RegionPipeline {
        RegionPipeline::new(self.ctx.clone(), descriptor.clone())
    }

    /// Run every configured region in parallel
    pub async fn run(&self, today: NaiveDate, cancel: CancellationToken) -> RunReport {
        let run_id = Uuid::new_v4();
        info!(run_id = %run_id, regions = self.regions.len(), "Starting ingestion run");

        let mut tasks = JoinSet::new();
        for descriptor in &self.regions {
            let pipeline = self.pipeline(descriptor);
            let token = cancel.child_token();
            let budget = self.region_timeout;
            tasks.spawn(async move { run_region(pipeline, today, token, budget).await });
        }

        let mut regions = Vec::with_capacity(self.regions.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => regions.push(report),
                Err(e) => error!(error = %e, "Region task panicked"),
            }
        }
        // a panicked region still gets a report
        for descriptor in &self.regions {
            let code = descriptor.region.to_string();
            if !regions.iter().any(|r| r.region == code) {
                let mut report = RegionReport::new(&descriptor.region);
                report.fatal_error = Some("region task aborted".to_string());
                regions.push(report);
            }
        }
        regions.sort_by(|a, b| a.region.cmp(&b.region));

        let global_master_location = if self.build_global_master && !cancel.is_cancelled() {
            match self.publish_global_master(today).await {
                Ok(location) => location,
                Err(e) => {
                    warn!(error = %e, "Global master dataset not published");
                    None
                },
            }
        } else {
            None
        };

        let report = RunReport {
            run_id,
            regions,
            global_master_location,
        };
        info!(
            run_id = %run_id,
            fatal = report.has_fatal(),
            interrupted = report.interrupted().count(),
            global = report.global_master_location.is_some(),
            "Ingestion run finished"
        );
        report
    }

    /// Union of every configured region's partitions, enriched per region
    pub async fn publish_global_master(&self, date: NaiveDate) -> Result<Option<String>> {
        let mut builder = ConsolidatedDatasetBuilder::new();
        let mut partitions = Vec::new();
        for descriptor in &self.regions {
            builder = builder.with_directory(
                descriptor.region.clone(),
                StationDirectory::new(&descriptor.stations),
            );
            partitions.extend(self.ctx.partitions(&descriptor.region).load_all()?);
        }
        self.ctx
            .publish_master(&partitions, &Scope::Global, &builder, date)
            .await
    }
}

/// How long a timed-out region gets to reach its next cancellation point
const CANCEL_GRACE: Duration = Duration::from_secs(30);

async fn run_region(
    pipeline: RegionPipeline,
    today: NaiveDate,
    cancel: CancellationToken,
    budget: Duration,
) -> RegionReport {
    let region = pipeline.region().clone();
    let run = pipeline.run(today, cancel.clone());
    tokio::pin!(run);

    let mut report = tokio::select! {
        report = &mut run => return report,
        _ = tokio::time::sleep(budget) => {
            cancel.cancel();
            match tokio::time::timeout(CANCEL_GRACE, &mut run).await {
                Ok(report) => report,
                Err(_) => {
                    error!(region = %region, "Region ignored cancellation; its counts are lost");
                    RegionReport::new(&region)
                },
            }
        },
    };

    let err = IngestError::Timeout(budget.as_secs());
    warn!(region = %region, error = %err, fetched = report.fetched, "Region timed out; committed artifacts are kept");
    report.interrupted = Some(err.to_string());
    report
}
