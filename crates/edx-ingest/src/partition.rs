//! Station partitioning
//!
//! [`StationPartitioner`] splits a normalized record stream by station key.
//! [`PartitionStore`] keeps one JSON-lines file per station under
//! `{state_dir}/partitions/{REGION}/` and applies artifact contributions to
//! them one station at a time: records tagged with the artifact identity are
//! removed first, then the new records are added. Reapplying the same
//! artifact therefore never duplicates rows.

use chrono::Datelike;
use edx_common::RegionCode;
use serde_jsonlines::{BufReadExt, WriteExt};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{IngestError, Result};
use crate::models::{Record, StationKey};

/// (year, month)
pub type Month = (i32, u32);

/// Records of one station, ordered by timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct StationPartition {
    pub key: StationKey,
    /// First-seen spelling of the station name
    pub display: String,
    pub records: Vec<Record>,
}

impl StationPartition {
    pub fn new(key: StationKey, display: impl Into<String>) -> Self {
        Self {
            key,
            display: display.into(),
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn months(&self) -> BTreeSet<Month> {
        self.records.iter().map(record_month).collect()
    }

    pub fn month_records(&self, month: Month) -> impl Iterator<Item = &Record> {
        self.records.iter().filter(move |r| record_month(r) == month)
    }

    /// JSON-lines encoding of one month's records
    pub fn encode_month(&self, month: Month) -> Result<Vec<u8>> {
        encode_records(self.month_records(month))
    }

    fn sort(&mut self) {
        // stable: rows sharing a timestamp keep arrival order
        self.records.sort_by_key(|r| r.timestamp);
    }
}

pub fn record_month(record: &Record) -> Month {
    let date = record.timestamp.date();
    (date.year(), date.month())
}

pub fn encode_records<'a>(records: impl IntoIterator<Item = &'a Record>) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.write_json_lines(records)?;
    Ok(buf)
}

pub fn decode_records(bytes: &[u8]) -> Result<Vec<Record>> {
    Ok(bytes.json_lines::<Record>().collect::<std::io::Result<Vec<_>>>()?)
}

// ============================================================================
// Partitioner
// ============================================================================

pub struct StationPartitioner;

impl StationPartitioner {
    /// Group records by normalized station key
    ///
    /// Within a station, records are ordered by timestamp and carry the
    /// first-seen display name. Records without a station are dropped.
    pub fn partition<I>(records: I) -> BTreeMap<StationKey, StationPartition>
    where
        I: IntoIterator<Item = Record>,
    {
        let mut partitions: BTreeMap<StationKey, StationPartition> = BTreeMap::new();
        let mut unkeyed = 0usize;

        for mut record in records {
            let Some(key) = record.station_key() else {
                unkeyed += 1;
                continue;
            };
            let partition = partitions
                .entry(key.clone())
                .or_insert_with(|| StationPartition::new(key, record.station.clone()));
            record.station.clone_from(&partition.display);
            partition.records.push(record);
        }

        if unkeyed > 0 {
            warn!(dropped = unkeyed, "Records without a station were dropped");
        }
        for partition in partitions.values_mut() {
            partition.sort();
        }
        partitions
    }
}

// ============================================================================
// Partition store
// ============================================================================

/// Outcome of applying one artifact to one station
#[derive(Debug, Clone)]
pub struct PartitionChange {
    /// Partition after the change; empty when the station lost all records
    pub partition: StationPartition,
    pub removed: usize,
    pub added: usize,
    /// Months whose content changed
    pub touched_months: BTreeSet<Month>,
}

#[derive(Debug, Clone)]
pub struct PartitionStore {
    root: PathBuf,
    region: RegionCode,
}

impl PartitionStore {
    pub fn new(state_dir: &Path, region: &RegionCode) -> Self {
        Self {
            root: state_dir.join("partitions").join(region.as_str()),
            region: region.clone(),
        }
    }

    pub fn region(&self) -> &RegionCode {
        &self.region
    }

    pub fn path_for(&self, key: &StationKey) -> PathBuf {
        self.root.join(format!("{}.jsonl", key.slug()))
    }

    pub fn load(&self, key: &StationKey) -> Result<Option<StationPartition>> {
        let path = self.path_for(key);
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let records = BufReader::new(file)
            .json_lines::<Record>()
            .collect::<std::io::Result<Vec<_>>>()?;
        let Some(first) = records.first() else {
            return Ok(None);
        };
        Ok(Some(StationPartition {
            key: key.clone(),
            display: first.station.clone(),
            records,
        }))
    }

    /// Every stored partition, ordered by station key
    pub fn load_all(&self) -> Result<Vec<StationPartition>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut partitions = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let bytes = std::fs::read(&path)?;
            let records = decode_records(&bytes)?;
            let Some(key) = records.first().and_then(Record::station_key) else {
                continue;
            };
            partitions.push(StationPartition {
                key,
                display: records[0].station.clone(),
                records,
            });
        }
        partitions.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(partitions)
    }

    /// Stations holding at least one record of `identity`
    pub fn stations_with(&self, identity: &str) -> Result<Vec<StationKey>> {
        Ok(self
            .load_all()?
            .into_iter()
            .filter(|p| p.records.iter().any(|r| r.provenance.identity == identity))
            .map(|p| p.key)
            .collect())
    }

    /// Compute the partition with `identity`'s contribution replaced by `incoming`
    ///
    /// Nothing is written; see [`PartitionStore::persist`].
    pub fn prepare(
        &self,
        key: &StationKey,
        identity: &str,
        incoming: Option<StationPartition>,
    ) -> Result<PartitionChange> {
        let existing = self.load(key)?;
        let display = existing
            .as_ref()
            .map(|p| p.display.clone())
            .or_else(|| incoming.as_ref().map(|p| p.display.clone()))
            .unwrap_or_else(|| key.to_string());

        let mut partition = existing.unwrap_or_else(|| StationPartition::new(key.clone(), display.clone()));
        let mut touched = BTreeSet::new();

        let before = partition.records.len();
        partition.records.retain(|r| {
            let stale = r.provenance.identity == identity;
            if stale {
                touched.insert(record_month(r));
            }
            !stale
        });
        let removed = before - partition.records.len();

        let mut added = 0;
        for mut record in incoming.into_iter().flat_map(|p| p.records) {
            if record.provenance.identity != identity {
                return Err(IngestError::Config(format!(
                    "record from {} applied as {}",
                    record.provenance.identity, identity
                )));
            }
            record.station.clone_from(&display);
            touched.insert(record_month(&record));
            partition.records.push(record);
            added += 1;
        }
        partition.sort();

        Ok(PartitionChange {
            partition,
            removed,
            added,
            touched_months: touched,
        })
    }

    /// Write one station's file atomically; an empty partition removes it
    pub fn persist(&self, change: &PartitionChange) -> Result<()> {
        if change.removed == 0 && change.added == 0 {
            return Ok(());
        }
        self.write(&change.partition)?;
        debug!(
            region = %self.region,
            station = %change.partition.key,
            removed = change.removed,
            added = change.added,
            total = change.partition.len(),
            "Station partition updated"
        );
        Ok(())
    }

    /// `prepare` followed by `persist`
    pub fn apply(
        &self,
        key: &StationKey,
        identity: &str,
        incoming: Option<StationPartition>,
    ) -> Result<PartitionChange> {
        let change = self.prepare(key, identity, incoming)?;
        self.persist(&change)?;
        Ok(change)
    }

    fn write(&self, partition: &StationPartition) -> Result<()> {
        let path = self.path_for(&partition.key);
        if partition.is_empty() {
            return match std::fs::remove_file(&path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        }

        std::fs::create_dir_all(&self.root)?;
        let bytes = encode_records(&partition.records)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| IngestError::Io(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::Provenance;
    use chrono::{NaiveDate, NaiveDateTime};

    fn ts(day: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 8, day)
            .unwrap()
            .and_hms_opt(0, minute, 0)
            .unwrap()
    }

    fn record(station: &str, at: NaiveDateTime, value: f64, identity: &str) -> Record {
        Record {
            timestamp: at,
            station: station.to_string(),
            fields: [("actual".to_string(), Some(value))].into_iter().collect(),
            region: "wrpc".parse().unwrap(),
            provenance: Provenance {
                artifact: format!("{}.zip", identity),
                source_path: format!("http://example.test/{}.zip", identity),
                identity: identity.to_string(),
                sheet: "sheet".into(),
            },
        }
    }

    fn multiset(records: &[Record]) -> Vec<String> {
        let mut keys: Vec<String> = records
            .iter()
            .map(|r| format!("{}|{}|{:?}", r.station.to_lowercase(), r.timestamp, r.fields))
            .collect();
        keys.sort();
        keys
    }

    #[test]
    fn test_partition_preserves_the_record_multiset() {
        let input = vec![
            record("Station A", ts(25, 15), 1.0, "w"),
            record("station  b", ts(25, 0), 2.0, "w"),
            record(" STATION A ", ts(25, 0), 3.0, "w"),
            record("Station B", ts(25, 15), 4.0, "w"),
            record("Station A", ts(25, 0), 5.0, "w"),
        ];
        let partitions = StationPartitioner::partition(input.clone());

        assert_eq!(partitions.len(), 2);
        let a = &partitions[&StationKey::new("station a").unwrap()];
        assert_eq!(a.display, "Station A");
        assert!(a.records.iter().all(|r| r.station == "Station A"));
        // ordered by timestamp, ties in arrival order
        let values: Vec<_> = a.records.iter().map(|r| r.fields["actual"]).collect();
        assert_eq!(values, vec![Some(3.0), Some(5.0), Some(1.0)]);

        let rebuilt: Vec<Record> = partitions.into_values().flat_map(|p| p.records).collect();
        let normalize = |rs: &[Record]| {
            multiset(
                &rs.iter()
                    .map(|r| {
                        let mut r = r.clone();
                        r.station = crate::models::collapse_whitespace(&r.station);
                        r
                    })
                    .collect::<Vec<_>>(),
            )
        };
        assert_eq!(normalize(&rebuilt), normalize(&input));
    }

    #[test]
    fn test_apply_supersedes_identity_without_touching_others() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartitionStore::new(dir.path(), &"wrpc".parse().unwrap());
        let key = StationKey::new("Station A").unwrap();

        let first = StationPartitioner::partition(vec![
            record("Station A", ts(25, 0), 1.0, "week"),
            record("Station A", ts(25, 15), 1.5, "week"),
        ]);
        let other = StationPartitioner::partition(vec![record("Station A", ts(18, 0), 9.0, "prior")]);

        store.apply(&key, "prior", other.get(&key).cloned()).unwrap();
        let change = store.apply(&key, "week", first.get(&key).cloned()).unwrap();
        assert_eq!((change.removed, change.added), (0, 2));
        assert_eq!(store.load(&key).unwrap().unwrap().len(), 3);

        // replaying the same contribution is idempotent
        let replay = store.apply(&key, "week", first.get(&key).cloned()).unwrap();
        assert_eq!((replay.removed, replay.added), (2, 2));
        assert_eq!(store.load(&key).unwrap().unwrap().len(), 3);

        // a revision with fewer rows fully replaces the week
        let revised = StationPartitioner::partition(vec![record("station a", ts(25, 0), 7.0, "week")]);
        store.apply(&key, "week", revised.get(&key).cloned()).unwrap();
        let stored = store.load(&key).unwrap().unwrap();
        assert_eq!(stored.display, "Station A");
        let values: Vec<_> = stored.records.iter().map(|r| r.fields["actual"]).collect();
        assert_eq!(values, vec![Some(9.0), Some(7.0)]);
        assert_eq!(store.stations_with("week").unwrap(), vec![key.clone()]);
    }

    #[test]
    fn test_apply_removes_emptied_partition() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartitionStore::new(dir.path(), &"wrpc".parse().unwrap());
        let key = StationKey::new("Station B").unwrap();
        let parts = StationPartitioner::partition(vec![record("Station B", ts(25, 0), 1.0, "week")]);

        store.apply(&key, "week", parts.get(&key).cloned()).unwrap();
        assert!(store.path_for(&key).exists());

        let change = store.apply(&key, "week", None).unwrap();
        assert!(change.partition.is_empty());
        assert_eq!(change.touched_months, [(2025, 8)].into_iter().collect());
        assert!(!store.path_for(&key).exists());
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_month_encoding_roundtrips() {
        let parts = StationPartitioner::partition(vec![
            record("Station C", ts(31, 0), 1.0, "w"),
            record("Station C", NaiveDate::from_ymd_opt(2025, 9, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(), 2.0, "w"),
        ]);
        let partition = parts.values().next().unwrap();
        assert_eq!(partition.months().len(), 2);

        let august = decode_records(&partition.encode_month((2025, 8)).unwrap()).unwrap();
        assert_eq!(august, vec![partition.records[0].clone()]);
    }
}
