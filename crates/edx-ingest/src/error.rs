//! Error taxonomy for the ingestion pipeline
//!
//! Every failure is scoped to the thing that produced it: a discovery
//! candidate, a sheet, an artifact, or a region. `is_retryable` drives the
//! shared retry policy and `is_fatal` decides whether a region run aborts.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Fetch failed for {url}: {message}")]
    Fetch {
        url: String,
        message: String,
        retryable: bool,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Parse error in sheet '{sheet}': {message}")]
    Parse { sheet: String, message: String },

    #[error("No parsable sheets in artifact {0}")]
    NoParsableSheets(String),

    #[error("Archive too large: {entries} entries / {bytes} bytes exceeds {limit}")]
    ArchiveTooLarge {
        entries: usize,
        bytes: u64,
        limit: String,
    },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Upload failed for {key}: {message}")]
    Upload { key: String, message: String },

    #[error("Object not found in store: {0}")]
    ObjectMissing(String),

    #[error("Ledger corruption in region {region}: {message}")]
    LedgerCorruption { region: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation timed out after {0}s")]
    Timeout(u64),

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] edx_common::EdxError),
}

impl IngestError {
    pub fn fetch(url: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        IngestError::Fetch {
            url: url.into(),
            message: message.into(),
            retryable,
        }
    }

    pub fn upload(key: impl Into<String>, message: impl ToString) -> Self {
        IngestError::Upload {
            key: key.into(),
            message: message.to_string(),
        }
    }

    pub fn parse(sheet: impl Into<String>, message: impl Into<String>) -> Self {
        IngestError::Parse {
            sheet: sheet.into(),
            message: message.into(),
        }
    }

    /// Transient failures worth another attempt under the retry policy
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Fetch { retryable, .. } => *retryable,
            IngestError::Upload { .. } | IngestError::Timeout(_) => true,
            IngestError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Failures that block the region's ledger and end its run
    pub fn is_fatal(&self) -> bool {
        matches!(self, IngestError::LedgerCorruption { .. } | IngestError::Config(_))
    }

    /// Run stopped early by cancellation or its time budget; nothing committed is lost
    pub fn is_interruption(&self) -> bool {
        matches!(self, IngestError::Cancelled | IngestError::Timeout(_))
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        let url = err.url().map(|u| u.to_string()).unwrap_or_default();
        let retryable = err.is_timeout()
            || err.is_connect()
            || err.is_request()
            || err.status().is_some_and(|s| s.is_server_error() || s.as_u16() == 429);
        IngestError::Fetch {
            url,
            message: err.to_string(),
            retryable,
        }
    }
}

impl From<regex::Error> for IngestError {
    fn from(err: regex::Error) -> Self {
        IngestError::Config(format!("invalid pattern: {}", err))
    }
}

impl From<csv::Error> for IngestError {
    fn from(err: csv::Error) -> Self {
        IngestError::parse("<csv>", err.to_string())
    }
}

impl From<zip::result::ZipError> for IngestError {
    fn from(err: zip::result::ZipError) -> Self {
        IngestError::Archive(err.to_string())
    }
}
