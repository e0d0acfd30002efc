//! Per-region pipeline
//!
//! One region at a time, strictly sequential within the region:
//!
//! 1. load the ledger (rebuilding it from manifests when corrupt, if enabled)
//! 2. discover artifacts and assess their freshness
//! 3. for each new or updated artifact: fetch, archive the raw blob, unpack,
//!    normalize, partition, replace the identity's previous contribution
//!    station by station (upload first, then the local file), upload the
//!    manifest, and only then commit the ledger
//! 4. rebuild and upload the region's master dataset and summary
//!
//! A crash anywhere before step 3's commit leaves the ledger untouched; the
//! artifact is simply processed again on the next run, and because a
//! contribution always replaces records of the same identity, doing so
//! never duplicates rows.

use chrono::NaiveDate;
use edx_common::checksum::sha256_hex;
use edx_common::RegionCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::archive::{self, ArchiveLimits};
use crate::consolidate::{ConsolidatedDatasetBuilder, Scope};
use crate::discovery;
use crate::error::{IngestError, Result};
use crate::freshness::{Freshness, FreshnessTracker};
use crate::ledger::{rebuild_from_manifests, Ledger, Manifest};
use crate::models::{Artifact, Record, StationKey};
use crate::normalize::{Normalizer, SheetContext};
use crate::partition::{PartitionStore, StationPartition, StationPartitioner};
use crate::remote::RemoteSource;
use crate::retry::RetryPolicy;
use crate::stations::StationDirectory;
use crate::storage::{
    ObjectPaths, ObjectStore, CONTENT_TYPE_BINARY, CONTENT_TYPE_CSV, CONTENT_TYPE_JSON, CONTENT_TYPE_JSONL,
};
use crate::config::SourceDescriptor;

// ============================================================================
// Reports
// ============================================================================

/// Why one artifact did not make it this run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactFailure {
    pub artifact: String,
    pub url: String,
    pub error: String,
    /// Retried automatically on the next run
    pub retryable: bool,
}

/// Outcome of one region's run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionReport {
    pub region: String,
    pub artifacts_discovered: usize,
    pub fetched: usize,
    pub skipped: usize,
    pub failed: usize,
    pub master_dataset_location: Option<String>,
    /// Set when the region stopped on a ledger-blocking error
    pub fatal_error: Option<String>,
    /// Set when cancellation or the time budget cut the run short; the
    /// counts above still cover everything done before that point
    pub interrupted: Option<String>,
    pub failures: Vec<ArtifactFailure>,
}

impl RegionReport {
    pub fn new(region: &RegionCode) -> Self {
        Self {
            region: region.to_string(),
            ..Self::default()
        }
    }

    fn record_failure(&mut self, artifact: &Artifact, error: &IngestError) {
        self.failed += 1;
        self.failures.push(ArtifactFailure {
            artifact: artifact.name.clone(),
            url: artifact.url.to_string(),
            error: error.to_string(),
            retryable: !matches!(error, IngestError::ArchiveTooLarge { .. }),
        });
    }
}

// ============================================================================
// Shared context
// ============================================================================

/// Collaborators shared by every region of a run
#[derive(Clone)]
pub struct PipelineContext {
    pub remote: Arc<dyn RemoteSource>,
    pub store: Arc<dyn ObjectStore>,
    pub ledger: Arc<dyn Ledger>,
    pub paths: ObjectPaths,
    pub retry: RetryPolicy,
    pub limits: ArchiveLimits,
    pub state_dir: PathBuf,
    pub recover_ledger: bool,
}

impl PipelineContext {
    pub fn partitions(&self, region: &RegionCode) -> PartitionStore {
        PartitionStore::new(&self.state_dir, region)
    }

    pub async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<()> {
        self.retry
            .run("upload", || self.store.put(key, data.to_vec(), content_type))
            .await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.retry.run("delete", || self.store.delete(key)).await
    }

    /// Build a scope's master dataset and summary and upload both
    ///
    /// Returns the master dataset location, or `None` when the scope has no rows.
    pub async fn publish_master(
        &self,
        partitions: &[StationPartition],
        scope: &Scope,
        builder: &ConsolidatedDatasetBuilder,
        date: NaiveDate,
    ) -> Result<Option<String>> {
        let (master, summary) = builder.build(partitions, scope);
        if master.row_count() == 0 {
            debug!(scope = scope.label(), "No rows; master dataset not published");
            return Ok(None);
        }

        let master_key = self.paths.master(scope.label(), date);
        let summary_key = self.paths.summary(scope.label(), date);
        self.put(&master_key, &master.to_csv()?, CONTENT_TYPE_CSV).await?;
        self.put(&summary_key, &serde_json::to_vec_pretty(&summary)?, CONTENT_TYPE_JSON)
            .await?;

        let location = self.store.location(&master_key);
        info!(
            scope = scope.label(),
            rows = summary.total_rows,
            location = %location,
            "Master dataset published"
        );
        Ok(Some(location))
    }
}

// ============================================================================
// Region pipeline
// ============================================================================

pub struct RegionPipeline {
    ctx: PipelineContext,
    descriptor: SourceDescriptor,
    partitions: PartitionStore,
    normalizer: Normalizer,
}

/// What happened to one artifact that needed processing
enum Applied {
    Committed { stations: usize, records: usize },
    Rejected,
}

impl RegionPipeline {
    pub fn new(ctx: PipelineContext, descriptor: SourceDescriptor) -> Self {
        let partitions = ctx.partitions(&descriptor.region);
        let normalizer = Normalizer::new(&descriptor.header, descriptor.blocks_per_day);
        Self {
            ctx,
            descriptor,
            partitions,
            normalizer,
        }
    }

    pub fn region(&self) -> &RegionCode {
        &self.descriptor.region
    }

    /// Run the region to completion; failures end up in the report
    #[instrument(skip(self, cancel), fields(region = %self.descriptor.region))]
    pub async fn run(&self, today: NaiveDate, cancel: CancellationToken) -> RegionReport {
        let mut report = RegionReport::new(self.region());

        match self.run_inner(today, &cancel, &mut report).await {
            Ok(()) => {},
            Err(e) if e.is_interruption() => {
                warn!(error = %e, "Region run interrupted; committed artifacts are kept");
                report.interrupted = Some(e.to_string());
            },
            Err(e) => {
                error!(error = %e, "Region run aborted");
                report.fatal_error = Some(e.to_string());
            },
        }

        info!(
            discovered = report.artifacts_discovered,
            fetched = report.fetched,
            skipped = report.skipped,
            failed = report.failed,
            "Region run finished"
        );
        report
    }

    async fn run_inner(&self, today: NaiveDate, cancel: &CancellationToken, report: &mut RegionReport) -> Result<()> {
        let mut tracker = self.open_tracker().await?;

        // an artifact dropped mid-way is never committed and is redone next run
        let discovered = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            result = discovery::discover(&self.descriptor, self.ctx.remote.clone(), today) => result,
        };

        match discovered {
            Ok(artifacts) => {
                report.artifacts_discovered = artifacts.len();
                for artifact in &artifacts {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                        handled = self.handle_artifact(&mut tracker, artifact, report) => handled?,
                    }
                }
            },
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                // existing partitions still yield a master dataset
                warn!(error = %e, "Discovery failed");
                report.failures.push(ArtifactFailure {
                    artifact: String::new(),
                    url: self.descriptor.base_url.to_string(),
                    error: e.to_string(),
                    retryable: true,
                });
            },
        }

        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        match self.publish_region_master(today).await {
            Ok(location) => report.master_dataset_location = location,
            Err(e) => {
                warn!(error = %e, "Master dataset not published");
                report.failures.push(ArtifactFailure {
                    artifact: String::new(),
                    url: self.ctx.paths.master(self.region().as_str(), today),
                    error: e.to_string(),
                    retryable: true,
                });
            },
        }
        Ok(())
    }

    async fn open_tracker(&self) -> Result<FreshnessTracker> {
        let region = self.region();
        let fingerprint = self.ctx.limits.fingerprint();
        match FreshnessTracker::open(self.ctx.ledger.clone(), region, fingerprint.clone()).await {
            Err(IngestError::LedgerCorruption { message, .. }) if self.ctx.recover_ledger => {
                warn!(region = %region, reason = %message, "Ledger corrupt; rebuilding from manifests");
                let state = rebuild_from_manifests(self.ctx.store.as_ref(), &self.ctx.paths, region).await?;
                self.ctx.ledger.store(&state).await?;
                Ok(FreshnessTracker::from_state(self.ctx.ledger.clone(), state, fingerprint))
            },
            other => other,
        }
    }

    /// Assess and, when needed, process one artifact; only fatal errors propagate
    async fn handle_artifact(
        &self,
        tracker: &mut FreshnessTracker,
        artifact: &Artifact,
        report: &mut RegionReport,
    ) -> Result<()> {
        let freshness = tracker.assess(artifact);
        if !freshness.needs_processing() {
            debug!(artifact = %artifact.name, freshness = freshness.label(), "Skipping artifact");
            report.skipped += 1;
            return Ok(());
        }

        match self.process_artifact(tracker, artifact, &freshness, report).await {
            Ok(Applied::Committed { stations, records }) => {
                info!(
                    artifact = %artifact.name,
                    freshness = freshness.label(),
                    stations,
                    records,
                    "Artifact committed"
                );
                Ok(())
            },
            Ok(Applied::Rejected) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(artifact = %artifact.name, error = %e, "Artifact failed; will retry next run");
                report.record_failure(artifact, &e);
                Ok(())
            },
        }
    }

    #[instrument(skip(self, tracker, freshness, report), fields(artifact = %artifact.name, window = %artifact.window))]
    async fn process_artifact(
        &self,
        tracker: &mut FreshnessTracker,
        artifact: &Artifact,
        freshness: &Freshness,
        report: &mut RegionReport,
    ) -> Result<Applied> {
        let region = self.region();
        let identity = artifact.identity().key();

        let blob = self.ctx.remote.fetch(&artifact.url).await?;
        report.fetched += 1;
        let content_sha256 = sha256_hex(&blob.bytes);

        let raw_key = self.ctx.paths.raw(region, artifact.window.end, &artifact.name);
        self.ctx.put(&raw_key, &blob.bytes, CONTENT_TYPE_BINARY).await?;

        let records = match self.parse_artifact(artifact, &blob.bytes, &identity) {
            Ok(records) => records,
            Err(e @ IngestError::ArchiveTooLarge { .. }) => {
                warn!(error = %e, "Archive rejected");
                report.record_failure(artifact, &e);
                tracker.reject(artifact, e.to_string()).await?;
                return Ok(Applied::Rejected);
            },
            Err(e) => return Err(e),
        };
        let record_count = records.len();
        let mut incoming = StationPartitioner::partition(records);

        // every station that holds or will hold rows of this identity
        let mut stations: BTreeSet<StationKey> = incoming.keys().cloned().collect();
        if let Freshness::Updated { previous } = freshness {
            stations.extend(previous.stations.iter().cloned());
        }
        stations.extend(self.partitions.stations_with(&identity)?);

        let mut objects = vec![raw_key];
        let mut contributed = Vec::new();
        for key in &stations {
            let change = self.partitions.prepare(key, &identity, incoming.remove(key))?;
            for &(year, month) in &change.touched_months {
                let object = self.ctx.paths.station_month(region, &key.slug(), year, month);
                if change.partition.month_records((year, month)).next().is_some() {
                    let bytes = change.partition.encode_month((year, month))?;
                    self.ctx.put(&object, &bytes, CONTENT_TYPE_JSONL).await?;
                } else {
                    self.ctx.delete(&object).await?;
                }
                objects.push(object);
            }
            self.partitions.persist(&change)?;
            if change.added > 0 {
                contributed.push(key.clone());
            }
        }

        let commit = FreshnessTracker::prepare_commit(artifact, contributed, content_sha256);
        let manifest = Manifest {
            identity: identity.clone(),
            region: region.clone(),
            commit: commit.clone(),
            objects,
        };
        let manifest_key = self.ctx.paths.manifest(region, artifact.window.end, &identity);
        self.ctx
            .put(&manifest_key, &serde_json::to_vec_pretty(&manifest)?, CONTENT_TYPE_JSON)
            .await?;

        let stations = commit.stations.len();
        tracker.commit(artifact, commit).await?;
        Ok(Applied::Committed {
            stations,
            records: record_count,
        })
    }

    /// Unpack and normalize; the artifact counts if at least one sheet parses
    pub fn parse_artifact(&self, artifact: &Artifact, bytes: &[u8], identity: &str) -> Result<Vec<Record>> {
        let context = SheetContext {
            region: self.region().clone(),
            artifact_name: artifact.name.clone(),
            source_path: artifact.url.to_string(),
            identity: identity.to_string(),
        };

        let mut records = Vec::new();
        let mut parsed = 0usize;
        let mut problems = Vec::new();

        for sheet in archive::unpack(bytes, &artifact.name, &self.ctx.limits)? {
            let sheet = sheet?;
            match self.normalizer.normalize(&sheet, &context) {
                Ok(mut rows) => {
                    let before = records.len();
                    records.extend(rows.by_ref());
                    parsed += 1;
                    debug!(
                        sheet = rows.sheet(),
                        records = records.len() - before,
                        skipped_rows = rows.skipped_rows(),
                        "Sheet normalized"
                    );
                },
                Err(e) => {
                    warn!(sheet = %sheet.name, error = %e, "Sheet excluded");
                    problems.push(e.to_string());
                },
            }
        }

        if parsed == 0 {
            let detail = if problems.is_empty() {
                "no tabular sheets".to_string()
            } else {
                problems.join("; ")
            };
            return Err(IngestError::NoParsableSheets(format!("{}: {}", artifact.name, detail)));
        }
        Ok(records)
    }

    pub async fn publish_region_master(&self, date: NaiveDate) -> Result<Option<String>> {
        let partitions = self.partitions.load_all()?;
        let builder = region_builder(&self.descriptor);
        self.ctx
            .publish_master(&partitions, &Scope::Region(self.region().clone()), &builder, date)
            .await
    }
}

/// Master dataset builder carrying the region's station directory
pub fn region_builder(descriptor: &SourceDescriptor) -> ConsolidatedDatasetBuilder {
    ConsolidatedDatasetBuilder::new().with_directory(
        descriptor.region.clone(),
        StationDirectory::new(&descriptor.stations),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{DiscoveryStrategy, HttpSettings};
    use crate::ledger::MemoryLedger;
    use crate::models::{Signature, Window};
    use crate::remote::HttpRemote;
    use crate::storage::LocalObjectStore;
    use std::io::Write;
    use url::Url;
    use zip::write::SimpleFileOptions;

    fn context(dir: &std::path::Path) -> PipelineContext {
        let retry = RetryPolicy {
            max_attempts: 1,
            base_delay_ms: 1,
            max_delay_ms: 1,
            timeout_secs: 10,
        };
        PipelineContext {
            remote: Arc::new(HttpRemote::new(&HttpSettings::default(), retry.clone()).unwrap()),
            store: Arc::new(LocalObjectStore::new(dir.join("store")).unwrap()),
            ledger: Arc::new(MemoryLedger::new()),
            paths: ObjectPaths::new("dsm_data"),
            retry,
            limits: ArchiveLimits::default(),
            state_dir: dir.join("state"),
            recover_ledger: true,
        }
    }

    fn pipeline(dir: &std::path::Path) -> RegionPipeline {
        let descriptor = SourceDescriptor::new(
            "wrpc".parse().unwrap(),
            Url::parse("http://example.test/").unwrap(),
            DiscoveryStrategy::PatternProbe {
                templates: vec!["{start:%d%m%y}.zip".into()],
                revision_templates: vec![],
                window_days: 7,
                anchor: chrono::Weekday::Mon,
            },
        );
        RegionPipeline::new(context(dir), descriptor)
    }

    fn artifact(name: &str) -> Artifact {
        let day = |d| NaiveDate::from_ymd_opt(2025, 8, d).unwrap();
        Artifact {
            region: "wrpc".parse().unwrap(),
            url: Url::parse(&format!("http://example.test/{}", name)).unwrap(),
            name: name.into(),
            window: Window::new(day(25), day(31)),
            family: "week".into(),
            revision: None,
            signature: Signature::from_headers(None, None, name, Some(1)),
        }
    }

    fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (name, body) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_parse_artifact_tolerates_bad_sheets() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let bytes = zip_of(&[
            ("notes.csv", "nothing,useful\nhere,at all\n"),
            ("A.csv", "Date,Block,Actual\n25-08-2025,1,10\n25-08-2025,2,11\n"),
        ]);

        let records = pipeline
            .parse_artifact(&artifact("week.zip"), &bytes, "WRPC|2025-08-25|2025-08-31|week")
            .unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.station == "A"));
        assert_eq!(records[0].provenance.identity, "WRPC|2025-08-25|2025-08-31|week");
    }

    #[test]
    fn test_parse_artifact_without_parsable_sheets_fails() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let bytes = zip_of(&[("notes.csv", "nothing,useful\n"), ("report.pdf", "%PDF")]);

        let err = pipeline
            .parse_artifact(&artifact("week.zip"), &bytes, "id")
            .unwrap_err();
        assert!(matches!(err, IngestError::NoParsableSheets(_)));
        assert!(!err.is_fatal());
    }
}
