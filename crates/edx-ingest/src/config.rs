//! Pipeline configuration
//!
//! A run is described by one TOML document (`PipelineConfig`) holding shared
//! settings plus one `SourceDescriptor` per region. Environment variables
//! override the shared settings; `.env` is loaded by the binary via dotenvy.
//!
//! # Examples
//!
//! ```rust,ignore
//! use edx_ingest::config::PipelineConfig;
//!
//! let config = PipelineConfig::from_file("config/regions.toml")?
//!     .with_env_overrides()?;
//! config.validate()?;
//! ```

use chrono::Weekday;
use edx_common::RegionCode;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::archive::ArchiveLimits;
use crate::error::{IngestError, Result};
use crate::retry::RetryPolicy;
use crate::stations::StationInfo;
use crate::storage::StorageSettings;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_STATE_DIR: &str = "./state";
pub const DEFAULT_HORIZON_DAYS: u32 = 7;
pub const DEFAULT_REGION_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_BLOCKS_PER_DAY: u32 = 96;
pub const DEFAULT_HEADER_SCAN_ROWS: usize = 15;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_USER_AGENT: &str = "EDX-Energy-Ingester/1.0";

// ============================================================================
// Pipeline configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Ledgers and station partitions live under this directory
    pub state_dir: PathBuf,

    /// Per-region wall clock budget
    pub region_timeout_secs: u64,

    /// Build an `ALL` master dataset after the regions finish
    pub build_global_master: bool,

    /// Rebuild a corrupt ledger from object-store manifests instead of failing
    pub recover_ledger_from_manifests: bool,

    pub http: HttpSettings,
    pub retry: RetryPolicy,
    pub archive: ArchiveLimits,
    pub storage: StorageSettings,

    #[serde(rename = "region")]
    pub regions: Vec<SourceDescriptor>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            region_timeout_secs: DEFAULT_REGION_TIMEOUT_SECS,
            build_global_master: true,
            recover_ledger_from_manifests: true,
            http: HttpSettings::default(),
            retry: RetryPolicy::default(),
            archive: ArchiveLimits::default(),
            storage: StorageSettings::default(),
            regions: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            IngestError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| IngestError::Config(e.to_string()))
    }

    /// Environment overrides for shared settings
    ///
    /// - `EDX_STATE_DIR`
    /// - `EDX_HORIZON_DAYS` (applied to every region)
    /// - `EDX_REGION_TIMEOUT_SECS`
    /// - `EDX_MAX_ARCHIVE_ENTRIES`, `EDX_MAX_ARCHIVE_BYTES`
    /// - `EDX_STORAGE_BACKEND`, `EDX_STORAGE_PREFIX`, `EDX_LOCAL_STORE_DIR`, `S3_*`
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(dir) = std::env::var("EDX_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(days) = env_parse::<u32>("EDX_HORIZON_DAYS")? {
            for region in &mut self.regions {
                region.horizon_days = days;
            }
        }
        if let Some(secs) = env_parse("EDX_REGION_TIMEOUT_SECS")? {
            self.region_timeout_secs = secs;
        }
        if let Some(entries) = env_parse("EDX_MAX_ARCHIVE_ENTRIES")? {
            self.archive.max_entries = entries;
        }
        if let Some(bytes) = env_parse("EDX_MAX_ARCHIVE_BYTES")? {
            self.archive.max_total_bytes = bytes;
        }
        self.storage = self.storage.with_env_overrides()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.regions.is_empty() {
            return Err(IngestError::Config("no regions configured".to_string()));
        }
        if self.region_timeout_secs == 0 {
            return Err(IngestError::Config(
                "region_timeout_secs must be greater than 0".to_string(),
            ));
        }
        self.retry.validate()?;
        self.archive.validate()?;

        let mut seen = std::collections::BTreeSet::new();
        for region in &self.regions {
            if !seen.insert(region.region.clone()) {
                return Err(IngestError::Config(format!(
                    "region {} configured twice",
                    region.region
                )));
            }
            region.validate()?;
        }
        Ok(())
    }

    pub fn region(&self, code: &RegionCode) -> Option<&SourceDescriptor> {
        self.regions.iter().find(|r| &r.region == code)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| IngestError::Config(format!("{} has invalid value '{}'", name, raw))),
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

// ============================================================================
// Source descriptor
// ============================================================================

/// Long-lived description of one publishing region
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub region: RegionCode,

    /// Index page or site root; templates and relative links resolve against it
    pub base_url: Url,

    pub strategy: DiscoveryStrategy,

    /// Wrap the strategy with revision detection
    #[serde(default = "default_true")]
    pub revision_aware: bool,

    /// Only artifacts whose window ends within this many days are considered
    #[serde(default = "default_horizon_days")]
    pub horizon_days: u32,

    /// Regexes marking a revised file; an optional `rev` group carries the number
    #[serde(default = "default_revision_patterns")]
    pub revision_patterns: Vec<String>,

    /// Regexes extracting the reporting window from a file name or row text
    #[serde(default = "default_window_patterns")]
    pub window_patterns: Vec<WindowPattern>,

    #[serde(default)]
    pub header: HeaderVocabulary,

    #[serde(default = "default_blocks_per_day")]
    pub blocks_per_day: u32,

    /// Optional station directory used to enrich master datasets
    #[serde(default)]
    pub stations: Vec<StationInfo>,
}

impl SourceDescriptor {
    pub fn new(region: RegionCode, base_url: Url, strategy: DiscoveryStrategy) -> Self {
        Self {
            region,
            base_url,
            strategy,
            revision_aware: true,
            horizon_days: DEFAULT_HORIZON_DAYS,
            revision_patterns: default_revision_patterns(),
            window_patterns: default_window_patterns(),
            header: HeaderVocabulary::default(),
            blocks_per_day: DEFAULT_BLOCKS_PER_DAY,
            stations: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.horizon_days == 0 {
            return Err(IngestError::Config(format!(
                "{}: horizon_days must be greater than 0",
                self.region
            )));
        }
        if self.blocks_per_day == 0 || 86_400 % self.blocks_per_day != 0 {
            return Err(IngestError::Config(format!(
                "{}: blocks_per_day must divide a day evenly",
                self.region
            )));
        }
        for pattern in &self.revision_patterns {
            Regex::new(pattern)?;
        }
        for pattern in &self.window_patterns {
            let regex = Regex::new(&pattern.regex)?;
            if !regex.capture_names().flatten().any(|n| n == "start") {
                return Err(IngestError::Config(format!(
                    "{}: window pattern '{}' has no 'start' group",
                    self.region, pattern.regex
                )));
            }
        }
        self.strategy.validate(&self.region)
    }
}

fn default_true() -> bool {
    true
}

fn default_horizon_days() -> u32 {
    DEFAULT_HORIZON_DAYS
}

fn default_blocks_per_day() -> u32 {
    DEFAULT_BLOCKS_PER_DAY
}

pub fn default_revision_patterns() -> Vec<String> {
    [
        r"(?i)[_\-\s]r[_\-]?(?P<rev>\d+)(?:[_\-.\s]|$)",
        r"(?i)[_\-\s]rev(?:ision)?[_\-\s]?(?P<rev>\d+)",
        // a bare `v` only counts as a marker at the end of the stem
        r"(?i)[_\-\s]v[_\-]?(?P<rev>\d+)$",
        r"(?i)[_\-\s]version[_\-\s]?(?P<rev>\d+)(?:[_\-.\s]|$)",
        r"(?i)\(r(?P<rev>\d+)\)",
        r"(?i)revised",
        r"(?i)dsmr(?P<rev>\d+)",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub fn default_window_patterns() -> Vec<WindowPattern> {
    vec![
        WindowPattern::new(
            r"(?P<start>\d{4}-\d{2}-\d{2})_to_(?P<end>\d{4}-\d{2}-\d{2})",
            "%Y-%m-%d",
        ),
        WindowPattern::new(
            r"(?P<start>\d{4}-\d{2}-\d{2})-(?P<end>\d{4}-\d{2}-\d{2})",
            "%Y-%m-%d",
        ),
        WindowPattern::new(
            r"(?P<start>\d{2}\.\d{2}\.\d{4})\s*(?:to|-)\s*(?P<end>\d{2}\.\d{2}\.\d{4})",
            "%d.%m.%Y",
        ),
        WindowPattern::new(r"(?P<start>\d{6})-(?P<end>\d{6})", "%d%m%y"),
        WindowPattern::new(r"(?:^|[^\d])(?P<start>\d{6})(?:[^\d]|$)", "%d%m%y"),
    ]
}

/// Regex with `start` (and optionally `end`) groups plus the chrono format of both
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowPattern {
    pub regex: String,
    pub format: String,
}

impl WindowPattern {
    pub fn new(regex: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            regex: regex.into(),
            format: format.into(),
        }
    }
}

// ============================================================================
// Discovery strategy
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiscoveryStrategy {
    /// Scrape hyperlinks from the column whose header matches a synonym
    TableScrape {
        /// Index page, relative to `base_url` (empty = `base_url` itself)
        #[serde(default)]
        index_path: String,
        column_synonyms: Vec<String>,
        /// Only links whose URL matches are kept
        #[serde(default)]
        link_pattern: Option<String>,
    },

    /// Generate dated URLs from templates and confirm each with a probe
    PatternProbe {
        /// e.g. `website/{end:%Y}/commercial/{start:%d%m%y}-{end:%d%m%y}.zip`
        templates: Vec<String>,
        #[serde(default)]
        revision_templates: Vec<String>,
        #[serde(default = "default_window_days")]
        window_days: u32,
        /// First day of each window
        #[serde(default = "default_anchor")]
        anchor: Weekday,
    },
}

fn default_window_days() -> u32 {
    7
}

fn default_anchor() -> Weekday {
    Weekday::Mon
}

impl DiscoveryStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            DiscoveryStrategy::TableScrape { .. } => "table_scrape",
            DiscoveryStrategy::PatternProbe { .. } => "pattern_probe",
        }
    }

    fn validate(&self, region: &RegionCode) -> Result<()> {
        match self {
            DiscoveryStrategy::TableScrape {
                column_synonyms,
                link_pattern,
                ..
            } => {
                if column_synonyms.iter().all(|s| s.trim().is_empty()) {
                    return Err(IngestError::Config(format!(
                        "{}: table_scrape needs at least one column synonym",
                        region
                    )));
                }
                if let Some(pattern) = link_pattern {
                    Regex::new(pattern)?;
                }
            },
            DiscoveryStrategy::PatternProbe {
                templates,
                revision_templates,
                window_days,
                ..
            } => {
                if templates.is_empty() {
                    return Err(IngestError::Config(format!(
                        "{}: pattern_probe needs at least one template",
                        region
                    )));
                }
                if *window_days == 0 {
                    return Err(IngestError::Config(format!(
                        "{}: window_days must be greater than 0",
                        region
                    )));
                }
                for template in templates.iter().chain(revision_templates) {
                    crate::discovery::pattern_probe::check_template(template)?;
                }
            },
        }
        Ok(())
    }
}

// ============================================================================
// Header vocabulary
// ============================================================================

/// Tokens used to recognize the logical header row and classify columns
///
/// Matching is case-insensitive on whitespace-collapsed cell text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderVocabulary {
    pub date: Vec<String>,
    pub time: Vec<String>,
    pub block: Vec<String>,
    pub entity: Vec<String>,
    /// Measurement names recognized inside wide `STATION_measure` headers
    pub measures: Vec<String>,
    /// Prefixes of banner rows naming the station, e.g. `Station :`
    pub banner_prefixes: Vec<String>,
    pub scan_rows: usize,
}

impl Default for HeaderVocabulary {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            date: owned(&["date", "day", "date time", "datetime", "date and time", "timestamp"]),
            time: owned(&["time", "time block", "timeblock", "period"]),
            block: owned(&["block", "block no", "block no.", "time block no", "blk"]),
            entity: owned(&["station", "station name", "entity", "utility", "constituent", "name"]),
            measures: owned(&[
                "actual", "schedule", "scheduled", "deviation", "frequency", "drawal", "injection",
                "dsm", "charges",
            ]),
            banner_prefixes: owned(&["station :", "station:", "entity :", "entity:"]),
            scan_rows: DEFAULT_HEADER_SCAN_ROWS,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
state_dir = "/tmp/edx-state"
region_timeout_secs = 600

[archive]
max_entries = 64
max_total_bytes = 1048576

[[region]]
region = "nerpc"
base_url = "https://nerpc.example/"
horizon_days = 14

[region.strategy]
kind = "table_scrape"
index_path = "?page_id=5823"
column_synonyms = ["Data File", "Download"]
link_pattern = '\.zip$'

[[region]]
region = "srpc"
base_url = "https://srpc.example/"

[region.strategy]
kind = "pattern_probe"
templates = ["website/{end:%Y}/commercial/{start:%d%m%y}-{end:%d%m%y}.zip"]
anchor = "Mon"
"#;

    #[test]
    fn test_parse_sample() {
        let config = PipelineConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.regions.len(), 2);
        assert_eq!(config.regions[0].region.as_str(), "NERPC");
        assert_eq!(config.regions[0].horizon_days, 14);
        assert_eq!(config.regions[1].horizon_days, DEFAULT_HORIZON_DAYS);
        assert_eq!(config.archive.max_entries, 64);
        assert!(config.regions[1].revision_aware);
        assert_eq!(config.regions[1].strategy.name(), "pattern_probe");
        config.validate().unwrap();
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let config = PipelineConfig::from_toml(include_str!("../../../config/regions.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.regions[0].stations.len(), 2);
        assert_eq!(config.regions[1].header.scan_rows, 20);
        assert!(!config.regions[1].header.date.is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_regex() {
        let mut config = PipelineConfig::from_toml(SAMPLE).unwrap();
        config.regions[0].revision_patterns.push("(unclosed".to_string());
        assert!(matches!(config.validate(), Err(IngestError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_region() {
        let mut config = PipelineConfig::from_toml(SAMPLE).unwrap();
        let dup = config.regions[0].clone();
        config.regions.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_uneven_blocks() {
        let mut config = PipelineConfig::from_toml(SAMPLE).unwrap();
        config.regions[1].blocks_per_day = 7;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_config_is_invalid() {
        assert!(PipelineConfig::default().validate().is_err());
    }

    #[test]
    fn test_default_patterns_compile() {
        for p in default_revision_patterns() {
            Regex::new(&p).unwrap();
        }
        for p in default_window_patterns() {
            Regex::new(&p.regex).unwrap();
        }
    }
}
