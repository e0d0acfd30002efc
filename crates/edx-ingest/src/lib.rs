//! EDX Ingest Library
//!
//! Incremental extraction of periodically published energy-measurement
//! files into per-station partitions and consolidated master datasets.
//!
//! # Pipeline
//!
//! - **Discovery**: table scraping or URL pattern probing, with revision matching
//! - **Freshness**: a per-region ledger decides what needs fetching
//! - **Normalization**: heterogeneous sheets become canonical [`models::Record`]s
//! - **Partitioning**: records are kept one file per station
//! - **Consolidation**: master dataset and summary per region and globally
//!
//! # Example
//!
//! ```no_run
//! use edx_ingest::{Orchestrator, PipelineConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::from_file("config/regions.toml")?.with_env_overrides()?;
//!     config.validate()?;
//!     let orchestrator = Orchestrator::from_config(&config).await?;
//!     let today = chrono::Local::now().date_naive();
//!     let report = orchestrator.run(today, CancellationToken::new()).await;
//!     println!("{}", serde_json::to_string_pretty(&report)?);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod archive;
pub mod config;
pub mod consolidate;
pub mod discovery;
pub mod error;
pub mod freshness;
pub mod ledger;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod partition;
pub mod pipeline;
pub mod remote;
pub mod retry;
pub mod stations;
pub mod storage;

pub use config::{DiscoveryStrategy, PipelineConfig, SourceDescriptor};
pub use error::{IngestError, Result};
pub use freshness::{Freshness, FreshnessTracker};
pub use models::{Artifact, Record, Signature, StationKey, Window};
pub use orchestrator::{Orchestrator, RunReport};
pub use pipeline::{PipelineContext, RegionPipeline, RegionReport};
