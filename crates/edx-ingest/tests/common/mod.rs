//! Shared fixtures for pipeline integration tests
//!
//! A wiremock server plays the regional publisher, a temp directory holds
//! the local object store and state, and the ledger is either in memory or
//! file backed.

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use edx_common::RegionCode;
use edx_ingest::archive::ArchiveLimits;
use edx_ingest::config::{DiscoveryStrategy, HttpSettings, SourceDescriptor};
use edx_ingest::ledger::{FileLedger, Ledger, MemoryLedger};
use edx_ingest::remote::HttpRemote;
use edx_ingest::retry::RetryPolicy;
use edx_ingest::storage::{LocalObjectStore, ObjectPaths};
use edx_ingest::{PipelineContext, RegionPipeline};
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zip::write::SimpleFileOptions;

pub const INDEX_PATH: &str = "/dsm/index.html";

pub const WEEK: &str = "WINDOW-2025-08-25_to_2025-08-31.zip";
pub const WEEK_R1: &str = "WINDOW-2025-08-25_to_2025-08-31_R1.zip";

pub const STATION_A: &str = "Date,Block,Actual (MWh),Schedule (MWh)\n\
                             25-08-2025,1,10.5,10\n\
                             25-08-2025,2,\"1,200.25\",NA\n";

/// Title rows above the header, as some publishers emit
pub const STATION_B_BANNERED: &str = "Northern Regional Power Committee,,\n\
                                      DSM account 01.09.2025 to 07.09.2025,,\n\
                                      Date,Block,Actual\n\
                                      25-08-2025,1,5\n\
                                      25-08-2025,2,6\n";

pub const STATION_A_REVISED: &str = "Date,Block,Actual (MWh),Schedule (MWh)\n\
                                     25-08-2025,1,11,10\n\
                                     25-08-2025,2,12,10\n\
                                     25-08-2025,3,13,10\n";

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,edx_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Processing date that keeps the fixture week inside a 7 day horizon
pub fn today() -> NaiveDate {
    day(2025, 9, 2)
}

pub fn region() -> RegionCode {
    "wrpc".parse().unwrap()
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 1,
        base_delay_ms: 1,
        max_delay_ms: 1,
        timeout_secs: 10,
    }
}

pub fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, body) in entries {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Index page with one table row per linked file
pub fn index_page(files: &[&str]) -> String {
    let rows: String = files
        .iter()
        .enumerate()
        .map(|(i, file)| {
            format!(
                "<tr><td>{}</td><td>25.08.2025 to 31.08.2025</td><td><a href=\"files/{}\">Download</a></td></tr>\n",
                i + 1,
                file
            )
        })
        .collect();
    format!(
        "<html><body><table>\n<tr><th>S.No</th><th>Duration</th><th>DSM Data File</th></tr>\n{}</table></body></html>",
        rows
    )
}

pub fn table_descriptor(server: &MockServer, code: &str) -> SourceDescriptor {
    SourceDescriptor::new(
        code.parse().unwrap(),
        Url::parse(&format!("{}/{}/", server.uri(), code)).unwrap(),
        DiscoveryStrategy::TableScrape {
            index_path: INDEX_PATH.trim_start_matches('/').to_string(),
            column_synonyms: vec!["Data File".into(), "Download".into()],
            link_pattern: Some(r"(?i)\.zip$".into()),
        },
    )
}

/// Serve the index page for `code`
pub async fn mount_index(server: &MockServer, code: &str, files: &[&str]) {
    Mock::given(method("GET"))
        .and(path(format!("/{}{}", code, INDEX_PATH)))
        .respond_with(ResponseTemplate::new(200).set_body_string(index_page(files)))
        .mount(server)
        .await;
}

/// Serve HEAD with `etag`; GET must be hit exactly `fetches` times
pub async fn mount_file(server: &MockServer, code: &str, file: &str, etag: &str, body: Vec<u8>, fetches: u64) {
    let file_path = format!("/{}/dsm/files/{}", code, file);
    Mock::given(method("HEAD"))
        .and(path(file_path.clone()))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", etag))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(file_path))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", etag)
                .insert_header("Content-Type", "application/zip")
                .set_body_bytes(body),
        )
        .expect(fetches)
        .mount(server)
        .await;
}

/// Temp workspace with a local object store and state directory
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn store_root(&self) -> PathBuf {
        self.dir.path().join("store")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.state_dir().join("ledger")
    }

    pub fn context_with(&self, ledger: Arc<dyn Ledger>, limits: ArchiveLimits, recover: bool) -> PipelineContext {
        PipelineContext {
            remote: Arc::new(HttpRemote::new(&HttpSettings::default(), fast_retry()).unwrap()),
            store: Arc::new(LocalObjectStore::new(self.store_root()).unwrap()),
            ledger,
            paths: ObjectPaths::new("dsm_data"),
            retry: fast_retry(),
            limits,
            state_dir: self.state_dir(),
            recover_ledger: recover,
        }
    }

    pub fn memory_context(&self) -> PipelineContext {
        self.context_with(Arc::new(MemoryLedger::new()), ArchiveLimits::default(), true)
    }

    pub fn file_context(&self, recover: bool) -> PipelineContext {
        self.context_with(
            Arc::new(FileLedger::new(self.ledger_dir())),
            ArchiveLimits::default(),
            recover,
        )
    }

    pub fn object(&self, key: &str) -> PathBuf {
        self.store_root().join(key)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.object(key).exists()
    }

    /// Every stored object key, sorted
    pub fn keys(&self) -> Vec<String> {
        let root = self.store_root();
        let mut keys = Vec::new();
        collect(&root, &root, &mut keys);
        keys.sort();
        keys
    }
}

fn collect(root: &Path, dir: &Path, keys: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect(root, &path, keys);
        } else if let Ok(relative) = path.strip_prefix(root) {
            keys.push(relative.to_string_lossy().replace('\\', "/"));
        }
    }
}

pub fn pipeline(ctx: &PipelineContext, descriptor: &SourceDescriptor) -> RegionPipeline {
    RegionPipeline::new(ctx.clone(), descriptor.clone())
}
