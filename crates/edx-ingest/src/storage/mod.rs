//! Object Store Gateway
//!
//! Raw blobs, station partitions, manifests and master datasets are written
//! through the `ObjectStore` trait. `S3ObjectStore` talks to S3 or MinIO;
//! `LocalObjectStore` mirrors the same key layout on disk.
//!
//! Key layout: `{prefix}/{kind}/{REGION}/{station?}/{yyyy}/{mm}/{filename}`
//! with `kind` one of `raw` or `processed`.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use edx_common::RegionCode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{IngestError, Result};

pub mod local;
pub mod s3;

pub use local::LocalObjectStore;
pub use s3::{S3Config, S3ObjectStore};

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_JSONL: &str = "application/x-ndjson";
pub const CONTENT_TYPE_CSV: &str = "text/csv";
pub const CONTENT_TYPE_BINARY: &str = "application/octet-stream";

/// Prefix of manifest file names inside `processed/{REGION}/{yyyy}/{mm}/`
pub const MANIFEST_PREFIX: &str = "_manifest_";

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<()>;

    /// `IngestError::ObjectMissing` when the key does not exist
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// All keys under `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Human readable location of a key (`s3://bucket/key`, `file:///...`)
    fn location(&self, key: &str) -> String;
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    S3,
    #[default]
    Local,
}

impl std::str::FromStr for StorageBackend {
    type Err = IngestError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "s3" | "minio" => Ok(StorageBackend::S3),
            "local" | "file" | "fs" => Ok(StorageBackend::Local),
            other => Err(IngestError::Config(format!("unknown storage backend '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    /// First key segment for every object
    pub prefix: String,
    /// Root directory for the local backend
    pub local_root: PathBuf,
    pub s3: S3Config,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            prefix: "dsm_data".to_string(),
            local_root: PathBuf::from("./object-store"),
            s3: S3Config::default(),
        }
    }
}

impl StorageSettings {
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(backend) = std::env::var("EDX_STORAGE_BACKEND") {
            self.backend = backend.parse()?;
        }
        if let Ok(prefix) = std::env::var("EDX_STORAGE_PREFIX") {
            self.prefix = prefix;
        }
        if let Ok(root) = std::env::var("EDX_LOCAL_STORE_DIR") {
            self.local_root = PathBuf::from(root);
        }
        self.s3 = self.s3.with_env_overrides();
        Ok(self)
    }
}

/// Build the configured backend
pub async fn open_store(settings: &StorageSettings) -> Result<Arc<dyn ObjectStore>> {
    match settings.backend {
        StorageBackend::Local => Ok(Arc::new(LocalObjectStore::new(&settings.local_root)?)),
        StorageBackend::S3 => Ok(Arc::new(S3ObjectStore::new(settings.s3.clone()).await?)),
    }
}

// ============================================================================
// Key layout
// ============================================================================

/// Region segment used for datasets spanning every region
pub const GLOBAL_SCOPE: &str = "ALL";

#[derive(Debug, Clone)]
pub struct ObjectPaths {
    prefix: String,
}

impl ObjectPaths {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        Self { prefix }
    }

    fn join(&self, parts: &[&str]) -> String {
        std::iter::once(self.prefix.as_str())
            .chain(parts.iter().copied())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn raw(&self, region: &RegionCode, date: NaiveDate, file_name: &str) -> String {
        let (year, month) = year_month(date);
        self.join(&["raw", region.as_str(), &year, &month, file_name])
    }

    /// One object per station and calendar month of its records
    pub fn station_month(&self, region: &RegionCode, station_slug: &str, year: i32, month: u32) -> String {
        let file_name = format!("{}_{}_{:04}{:02}.jsonl", region, station_slug, year, month);
        self.join(&[
            "processed",
            region.as_str(),
            station_slug,
            &format!("{:04}", year),
            &format!("{:02}", month),
            &file_name,
        ])
    }

    pub fn manifest(&self, region: &RegionCode, window_end: NaiveDate, identity_key: &str) -> String {
        let (year, month) = year_month(window_end);
        let file_name = format!(
            "{}{}.json",
            MANIFEST_PREFIX,
            edx_common::checksum::short_digest(identity_key)
        );
        self.join(&["processed", region.as_str(), &year, &month, &file_name])
    }

    /// Listing prefix covering every processed object of a region
    pub fn processed_root(&self, region: &RegionCode) -> String {
        format!("{}/", self.join(&["processed", region.as_str()]))
    }

    pub fn master(&self, scope: &str, date: NaiveDate) -> String {
        let (year, month) = year_month(date);
        self.join(&["processed", scope, &year, &month, &format!("{}_master.csv", scope)])
    }

    pub fn summary(&self, scope: &str, date: NaiveDate) -> String {
        let (year, month) = year_month(date);
        self.join(&["processed", scope, &year, &month, &format!("{}_summary.json", scope)])
    }
}

fn year_month(date: NaiveDate) -> (String, String) {
    (format!("{:04}", date.year()), format!("{:02}", date.month()))
}

pub fn is_manifest_key(key: &str) -> bool {
    key.rsplit('/')
        .next()
        .is_some_and(|name| name.starts_with(MANIFEST_PREFIX) && name.ends_with(".json"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn region() -> RegionCode {
        "nrldc".parse().unwrap()
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_raw_key() {
        let paths = ObjectPaths::new("/dsm_data/");
        assert_eq!(
            paths.raw(&region(), day("2025-08-31"), "week.zip"),
            "dsm_data/raw/NRLDC/2025/08/week.zip"
        );
    }

    #[test]
    fn test_station_key_layout() {
        let paths = ObjectPaths::new("dsm_data");
        assert_eq!(
            paths.station_month(&region(), "STATION_A", 2025, 9),
            "dsm_data/processed/NRLDC/STATION_A/2025/09/NRLDC_STATION_A_202509.jsonl"
        );
    }

    #[test]
    fn test_manifest_key_is_recognized() {
        let paths = ObjectPaths::new("dsm_data");
        let key = paths.manifest(&region(), day("2025-08-31"), "NRLDC|2025-08-25|2025-08-31|w");
        assert!(key.starts_with("dsm_data/processed/NRLDC/2025/08/_manifest_"));
        assert!(is_manifest_key(&key));
        assert!(!is_manifest_key("dsm_data/processed/NRLDC/2025/08/NRLDC_master.csv"));
        assert!(key.starts_with(&paths.processed_root(&region())));
    }

    #[test]
    fn test_master_keys() {
        let paths = ObjectPaths::new("");
        assert_eq!(
            paths.master(GLOBAL_SCOPE, day("2025-09-01")),
            "processed/ALL/2025/09/ALL_master.csv"
        );
        assert_eq!(
            paths.summary("SRPC", day("2025-09-01")),
            "processed/SRPC/2025/09/SRPC_summary.json"
        );
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("MinIO".parse::<StorageBackend>().unwrap(), StorageBackend::S3);
        assert_eq!("fs".parse::<StorageBackend>().unwrap(), StorageBackend::Local);
        assert!("ftp".parse::<StorageBackend>().is_err());
    }
}
