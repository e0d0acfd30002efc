//! EDX Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the EDX energy-data workspace.
//!
//! # Overview
//!
//! - **Error Handling**: `EdxError` and the crate `Result` alias
//! - **Checksums**: content hashing for fetched blobs and manifests
//! - **Logging**: one subscriber setup for every binary
//! - **Types**: the region code shared by storage paths and ledgers
//!
//! # Example
//!
//! ```no_run
//! use edx_common::checksum::sha256_hex;
//! use edx_common::RegionCode;
//!
//! fn main() -> edx_common::Result<()> {
//!     let region: RegionCode = "nrldc".parse()?;
//!     println!("{} {}", region, sha256_hex(b"weekly.zip"));
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{EdxError, Result};
pub use types::RegionCode;
