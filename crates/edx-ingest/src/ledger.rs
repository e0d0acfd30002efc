//! Processed-artifact ledger
//!
//! One ledger per region maps an artifact identity to the last committed
//! contribution (signature, revision, stations touched) and, separately, to
//! the last rejection. The pipeline only writes it after partitions and the
//! artifact manifest are uploaded.
//!
//! `FileLedger` keeps `{dir}/{REGION}.json` and replaces it atomically.
//! `MemoryLedger` is the test double. A lost or corrupt ledger can be rebuilt
//! from the manifests stored next to the processed data.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use edx_common::RegionCode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};
use crate::models::{Signature, StationKey};
use crate::storage::{is_manifest_key, ObjectPaths, ObjectStore};

pub const LEDGER_FORMAT_VERSION: u32 = 1;

/// Contribution of one committed artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub artifact: String,
    pub source_path: String,
    pub signature: Signature,
    pub revision: Option<u32>,
    pub committed_at: DateTime<Utc>,
    /// Stations currently holding records tagged with this identity
    pub stations: Vec<StationKey>,
    pub content_sha256: String,
}

impl Commit {
    pub fn revision_rank(&self) -> u32 {
        self.revision.unwrap_or(0)
    }
}

/// Last refusal to process an artifact (archive caps)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub artifact: String,
    pub signature: Signature,
    /// Archive limits in force when rejected
    pub limits: String,
    pub reason: String,
    pub rejected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub committed: Option<Commit>,
    pub rejected: Option<Rejection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    pub format_version: u32,
    pub region: RegionCode,
    /// Keyed by `ArtifactIdentity::key`
    pub entries: BTreeMap<String, LedgerEntry>,
}

impl LedgerState {
    pub fn empty(region: RegionCode) -> Self {
        Self {
            format_version: LEDGER_FORMAT_VERSION,
            region,
            entries: BTreeMap::new(),
        }
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Empty state when nothing was ever stored; `LedgerCorruption` when unreadable
    async fn load(&self, region: &RegionCode) -> Result<LedgerState>;

    /// Durably replace the region's state
    async fn store(&self, state: &LedgerState) -> Result<()>;
}

// ============================================================================
// File ledger
// ============================================================================

#[derive(Debug, Clone)]
pub struct FileLedger {
    dir: PathBuf,
}

impl FileLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, region: &RegionCode) -> PathBuf {
        self.dir.join(format!("{}.json", region))
    }
}

#[async_trait]
impl Ledger for FileLedger {
    async fn load(&self, region: &RegionCode) -> Result<LedgerState> {
        let path = self.path_for(region);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(region = %region, "No ledger yet; starting empty");
                return Ok(LedgerState::empty(region.clone()));
            },
            Err(e) => return Err(e.into()),
        };

        let corrupt = |message: String| IngestError::LedgerCorruption {
            region: region.to_string(),
            message,
        };
        let state: LedgerState =
            serde_json::from_slice(&raw).map_err(|e| corrupt(format!("{}: {}", path.display(), e)))?;
        if state.region != *region {
            return Err(corrupt(format!("file belongs to region {}", state.region)));
        }
        if state.format_version != LEDGER_FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format version {}", state.format_version)));
        }
        Ok(state)
    }

    async fn store(&self, state: &LedgerState) -> Result<()> {
        let dir = self.dir.clone();
        let path = self.path_for(&state.region);
        let json = serde_json::to_vec_pretty(state)?;

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::create_dir_all(&dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&json)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| IngestError::Io(std::io::Error::other(e)))??;

        debug!(region = %state.region, entries = state.entries.len(), "Ledger stored");
        Ok(())
    }
}

// ============================================================================
// In-memory ledger
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryLedger {
    states: Mutex<HashMap<RegionCode, LedgerState>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn load(&self, region: &RegionCode) -> Result<LedgerState> {
        let states = self
            .states
            .lock()
            .map_err(|e| IngestError::Io(std::io::Error::other(e.to_string())))?;
        Ok(states
            .get(region)
            .cloned()
            .unwrap_or_else(|| LedgerState::empty(region.clone())))
    }

    async fn store(&self, state: &LedgerState) -> Result<()> {
        let mut states = self
            .states
            .lock()
            .map_err(|e| IngestError::Io(std::io::Error::other(e.to_string())))?;
        states.insert(state.region.clone(), state.clone());
        Ok(())
    }
}

// ============================================================================
// Manifests
// ============================================================================

/// Per-artifact commit record uploaded next to the processed data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub identity: String,
    pub region: RegionCode,
    pub commit: Commit,
    /// Object keys written for this artifact
    pub objects: Vec<String>,
}

/// Rebuild a region's ledger from the manifests in the object store
///
/// Presence of a manifest implies the artifact's partitions were uploaded.
/// When several manifests share an identity the latest commit wins.
pub async fn rebuild_from_manifests(
    store: &dyn ObjectStore,
    paths: &ObjectPaths,
    region: &RegionCode,
) -> Result<LedgerState> {
    let keys = store.list(&paths.processed_root(region)).await?;
    let mut state = LedgerState::empty(region.clone());
    let mut recovered = 0usize;

    for key in keys.iter().filter(|k| is_manifest_key(k)) {
        let bytes = store.get(key).await?;
        let manifest: Manifest = match serde_json::from_slice(&bytes) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(key = %key, error = %e, "Skipping unreadable manifest");
                continue;
            },
        };
        if manifest.region != *region {
            continue;
        }

        let entry = state.entries.entry(manifest.identity).or_default();
        let newer = entry
            .committed
            .as_ref()
            .is_none_or(|c| c.committed_at <= manifest.commit.committed_at);
        if newer {
            entry.committed = Some(manifest.commit);
        }
        recovered += 1;
    }

    info!(region = %region, manifests = recovered, entries = state.entries.len(), "Ledger rebuilt from manifests");
    Ok(state)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::{LocalObjectStore, CONTENT_TYPE_JSON};
    use chrono::NaiveDate;

    fn region() -> RegionCode {
        "srpc".parse().unwrap()
    }

    fn commit(artifact: &str, at: i64) -> Commit {
        Commit {
            artifact: artifact.into(),
            source_path: format!("http://example/{}", artifact),
            signature: Signature::Weak {
                name: artifact.into(),
                size: Some(10),
            },
            revision: None,
            committed_at: DateTime::from_timestamp(at, 0).unwrap(),
            stations: vec![StationKey::new("Station A").unwrap()],
            content_sha256: "00".into(),
        }
    }

    #[tokio::test]
    async fn test_file_ledger_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FileLedger::new(dir.path());

        let mut state = ledger.load(&region()).await.unwrap();
        assert!(state.entries.is_empty());

        state.entries.insert(
            "SRPC|2025-08-25|2025-08-31|week".into(),
            LedgerEntry {
                committed: Some(commit("week.zip", 1_756_000_000)),
                rejected: None,
            },
        );
        ledger.store(&state).await.unwrap();

        let reloaded = FileLedger::new(dir.path()).load(&region()).await.unwrap();
        assert_eq!(reloaded, state);
    }

    #[tokio::test]
    async fn test_file_ledger_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FileLedger::new(dir.path());
        std::fs::write(ledger.path_for(&region()), b"{ not json").unwrap();

        let err = ledger.load(&region()).await.unwrap_err();
        assert!(matches!(err, IngestError::LedgerCorruption { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_rebuild_prefers_latest_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path()).unwrap();
        let paths = ObjectPaths::new("dsm_data");
        let end = NaiveDate::from_ymd_opt(2025, 8, 31).unwrap();
        let identity = "SRPC|2025-08-25|2025-08-31|week";

        for (suffix, at) in [("a", 100), ("b", 200)] {
            let manifest = Manifest {
                identity: identity.into(),
                region: region(),
                commit: commit(&format!("week_{}.zip", suffix), at),
                objects: vec![],
            };
            let key = paths.manifest(&region(), end, &format!("{}{}", identity, suffix));
            store
                .put(&key, serde_json::to_vec(&manifest).unwrap(), CONTENT_TYPE_JSON)
                .await
                .unwrap();
        }
        store
            .put(
                &format!("{}2025/08/SRPC_master.csv", paths.processed_root(&region())),
                b"x".to_vec(),
                "text/csv",
            )
            .await
            .unwrap();

        let state = rebuild_from_manifests(&store, &paths, &region()).await.unwrap();
        assert_eq!(state.entries.len(), 1);
        let committed = state.entries[identity].committed.as_ref().unwrap();
        assert_eq!(committed.artifact, "week_b.zip");
    }
}
