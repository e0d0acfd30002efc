//! Consolidated master datasets
//!
//! Merges station partitions into one table per scope (a region, or every
//! region) and computes summary statistics. Output depends only on partition
//! content: two builds over the same partitions differ in the processing
//! timestamp and nothing else.

use chrono::{DateTime, SecondsFormat, Utc};
use edx_common::RegionCode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{info, instrument};

use crate::error::{IngestError, Result};
use crate::models::{Record, StationKey};
use crate::partition::StationPartition;
use crate::stations::StationDirectory;
use crate::storage::GLOBAL_SCOPE;

pub const DEFAULT_TOP_STATIONS: usize = 20;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Region(RegionCode),
    Global,
}

impl Scope {
    pub fn label(&self) -> &str {
        match self {
            Scope::Region(region) => region.as_str(),
            Scope::Global => GLOBAL_SCOPE,
        }
    }

    fn includes(&self, region: &RegionCode) -> bool {
        match self {
            Scope::Region(r) => r == region,
            Scope::Global => true,
        }
    }
}

/// Ordered, provenance-carrying union of partitions in a scope
#[derive(Debug, Clone, PartialEq)]
pub struct MasterDataset {
    pub scope: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub processed_at: DateTime<Utc>,
}

impl MasterDataset {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.into_inner().map_err(|e| IngestError::Io(e.into_error()))
    }

    /// Rows without the trailing processing timestamp column
    pub fn content(&self) -> Vec<&[String]> {
        self.rows
            .iter()
            .map(|row| &row[..row.len().saturating_sub(1)])
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationVolume {
    pub region: String,
    pub station: String,
    pub rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub scope: String,
    pub total_rows: usize,
    pub total_columns: usize,
    pub rows_per_region: BTreeMap<String, usize>,
    pub top_stations: Vec<StationVolume>,
    pub non_null_counts: BTreeMap<String, usize>,
    pub contributing_artifacts: Vec<String>,
    pub processed_at: DateTime<Utc>,
}

impl Summary {
    /// Summary with the processing timestamp blanked, for comparisons
    pub fn without_timestamp(&self) -> Summary {
        Summary {
            processed_at: DateTime::<Utc>::default(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsolidatedDatasetBuilder {
    directories: HashMap<RegionCode, StationDirectory>,
    top_stations: usize,
}

impl Default for ConsolidatedDatasetBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsolidatedDatasetBuilder {
    pub fn new() -> Self {
        Self {
            directories: HashMap::new(),
            top_stations: DEFAULT_TOP_STATIONS,
        }
    }

    pub fn with_directory(mut self, region: RegionCode, directory: StationDirectory) -> Self {
        if !directory.is_empty() {
            self.directories.insert(region, directory);
        }
        self
    }

    pub fn top_stations(mut self, n: usize) -> Self {
        self.top_stations = n;
        self
    }

    pub fn build(&self, partitions: &[StationPartition], scope: &Scope) -> (MasterDataset, Summary) {
        self.build_at(partitions, scope, Utc::now())
    }

    #[instrument(skip(self, partitions), fields(scope = scope.label(), partitions = partitions.len()))]
    pub fn build_at(
        &self,
        partitions: &[StationPartition],
        scope: &Scope,
        processed_at: DateTime<Utc>,
    ) -> (MasterDataset, Summary) {
        // station key, region, timestamp; stable sort keeps partition order on ties
        let mut selected: Vec<(&StationPartition, &Record)> = partitions
            .iter()
            .flat_map(|p| p.records.iter().map(move |r| (p, r)))
            .filter(|(_, r)| scope.includes(&r.region))
            .collect();
        selected.sort_by(|(pa, ra), (pb, rb)| {
            (&pa.key, ra.region.as_str(), ra.timestamp).cmp(&(&pb.key, rb.region.as_str(), rb.timestamp))
        });

        let fields: BTreeSet<&str> = selected
            .iter()
            .flat_map(|(_, r)| r.fields.keys().map(String::as_str))
            .collect();
        let with_directory = selected
            .iter()
            .any(|(_, r)| self.directories.contains_key(&r.region));

        let mut columns: Vec<String> = ["timestamp", "region", "station"].map(String::from).to_vec();
        columns.extend(fields.iter().map(|f| f.to_string()));
        if with_directory {
            columns.extend(["state", "regional_group"].map(String::from));
        }
        columns.extend(["source_artifact", "source_path", "sheet", "processing_timestamp"].map(String::from));

        let stamp = processed_at.to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut rows = Vec::with_capacity(selected.len());
        let mut non_null: Vec<usize> = vec![0; columns.len()];
        let mut rows_per_region: BTreeMap<String, usize> = BTreeMap::new();
        let mut station_rows: BTreeMap<(String, String), usize> = BTreeMap::new();
        let mut artifacts: BTreeSet<&str> = BTreeSet::new();

        for (partition, record) in &selected {
            let mut row = Vec::with_capacity(columns.len());
            row.push(record.timestamp.format(TIMESTAMP_FORMAT).to_string());
            row.push(record.region.to_string());
            row.push(partition.display.clone());
            for field in &fields {
                row.push(match record.fields.get(*field) {
                    Some(Some(value)) => value.to_string(),
                    _ => String::new(),
                });
            }
            if with_directory {
                let info = self.lookup(&record.region, &partition.key);
                row.push(info.and_then(|i| i.state.clone()).unwrap_or_default());
                row.push(info.and_then(|i| i.regional_group.clone()).unwrap_or_default());
            }
            row.push(record.provenance.artifact.clone());
            row.push(record.provenance.source_path.clone());
            row.push(record.provenance.sheet.clone());
            row.push(stamp.clone());

            for (count, cell) in non_null.iter_mut().zip(&row) {
                if !cell.is_empty() {
                    *count += 1;
                }
            }
            *rows_per_region.entry(record.region.to_string()).or_default() += 1;
            *station_rows
                .entry((record.region.to_string(), partition.display.clone()))
                .or_default() += 1;
            artifacts.insert(record.provenance.artifact.as_str());
            rows.push(row);
        }

        let mut top: Vec<StationVolume> = station_rows
            .into_iter()
            .map(|((region, station), rows)| StationVolume { region, station, rows })
            .collect();
        top.sort_by(|a, b| {
            b.rows
                .cmp(&a.rows)
                .then_with(|| a.station.cmp(&b.station))
                .then_with(|| a.region.cmp(&b.region))
        });
        top.truncate(self.top_stations);

        let summary = Summary {
            scope: scope.label().to_string(),
            total_rows: rows.len(),
            total_columns: columns.len(),
            rows_per_region,
            top_stations: top,
            non_null_counts: columns.iter().cloned().zip(non_null).collect(),
            contributing_artifacts: artifacts.into_iter().map(str::to_string).collect(),
            processed_at,
        };
        info!(
            rows = summary.total_rows,
            columns = summary.total_columns,
            artifacts = summary.contributing_artifacts.len(),
            "Master dataset built"
        );

        let dataset = MasterDataset {
            scope: scope.label().to_string(),
            columns,
            rows,
            processed_at,
        };
        (dataset, summary)
    }

    fn lookup(&self, region: &RegionCode, key: &StationKey) -> Option<&crate::stations::StationInfo> {
        self.directories.get(region).and_then(|d| d.lookup(key))
    }
}
