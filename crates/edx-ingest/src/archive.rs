//! Archive unpacking
//!
//! Turns a fetched blob into `(sheet name, raw tabular content)` pairs.
//!
//! # Supported Containers
//!
//! - **Zip**: entries inflated one at a time as the iterator advances
//! - **Gzip** (.gz): a single compressed sheet, or a tar inside
//! - **Tar** / **Tar.gz**: members read up front within the byte budget
//! - **Plain**: the blob is itself one sheet
//!
//! Only `.csv`, `.txt` and `.tsv` members are sheets; anything else
//! (workbooks, PDFs, nested archives) is skipped with a warning.
//!
//! Entry count and total decompressed size are capped. Zip archives are
//! checked against their central directory before anything is inflated, and
//! every read is bounded by the remaining budget so a header understating
//! sizes still cannot exhaust memory.

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};
use tracing::{debug, warn};

use crate::error::{IngestError, Result};

pub const DEFAULT_MAX_ENTRIES: usize = 512;
pub const DEFAULT_MAX_TOTAL_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveLimits {
    pub max_entries: usize,
    pub max_total_bytes: u64,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
        }
    }
}

impl ArchiveLimits {
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 || self.max_total_bytes == 0 {
            return Err(IngestError::Config("archive limits must be greater than 0".into()));
        }
        Ok(())
    }

    /// Recorded with rejections so a config change re-admits the artifact
    pub fn fingerprint(&self) -> String {
        format!("entries<={};bytes<={}", self.max_entries, self.max_total_bytes)
    }

    fn too_large(&self, entries: usize, bytes: u64) -> IngestError {
        IngestError::ArchiveTooLarge {
            entries,
            bytes,
            limit: self.fingerprint(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Zip,
    Gzip,
    Tar,
    Plain,
}

impl ContainerKind {
    /// Magic bytes first, then the file extension
    pub fn sniff(bytes: &[u8], name: &str) -> Self {
        if bytes.starts_with(b"PK\x03\x04") || bytes.starts_with(b"PK\x05\x06") {
            return ContainerKind::Zip;
        }
        if bytes.starts_with(&[0x1f, 0x8b]) {
            return ContainerKind::Gzip;
        }
        if is_tar(bytes) {
            return ContainerKind::Tar;
        }
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            ContainerKind::Zip
        } else if lower.ends_with(".gz") || lower.ends_with(".tgz") {
            ContainerKind::Gzip
        } else if lower.ends_with(".tar") {
            ContainerKind::Tar
        } else {
            ContainerKind::Plain
        }
    }
}

fn is_tar(bytes: &[u8]) -> bool {
    bytes.get(257..262) == Some(b"ustar".as_slice())
}

/// One raw tabular sheet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sheet {
    /// Member file stem, e.g. `Station A` for `week/Station A.csv`
    pub name: String,
    pub content: String,
    pub delimiter: u8,
}

fn sheet_format(name: &str) -> Option<u8> {
    let lower = name.to_ascii_lowercase();
    let ext = lower.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    match ext {
        "csv" | "txt" => Some(b','),
        "tsv" | "tab" => Some(b'\t'),
        _ => None,
    }
}

fn sheet_name(path: &str) -> String {
    let file = path.rsplit(['/', '\\']).next().unwrap_or(path);
    match file.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => file.to_string(),
    }
}

fn decode(bytes: Vec<u8>) -> String {
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    };
    text.trim_start_matches('\u{feff}').to_string()
}

/// Read at most `budget` bytes; more than that is a cap violation
fn read_bounded<R: Read>(reader: R, budget: u64) -> std::io::Result<Option<Vec<u8>>> {
    let mut out = Vec::new();
    reader.take(budget.saturating_add(1)).read_to_end(&mut out)?;
    if out.len() as u64 > budget {
        Ok(None)
    } else {
        Ok(Some(out))
    }
}

/// Lazy sequence of sheets produced by [`unpack`]
pub struct Sheets<'a> {
    source: Source<'a>,
}

enum Source<'a> {
    Zip {
        archive: zip::ZipArchive<Cursor<&'a [u8]>>,
        next: usize,
        consumed: u64,
        limits: ArchiveLimits,
    },
    Buffered(std::vec::IntoIter<Sheet>),
}

impl Iterator for Sheets<'_> {
    type Item = Result<Sheet>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.source {
            Source::Buffered(sheets) => sheets.next().map(Ok),
            Source::Zip {
                archive,
                next,
                consumed,
                limits,
            } => {
                while *next < archive.len() {
                    let index = *next;
                    *next += 1;
                    match next_zip_sheet(archive, index, consumed, limits) {
                        Ok(Some(sheet)) => return Some(Ok(sheet)),
                        Ok(None) => continue,
                        Err(e) => {
                            // stop after the first failure
                            *next = archive.len();
                            return Some(Err(e));
                        },
                    }
                }
                None
            },
        }
    }
}

fn next_zip_sheet(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    index: usize,
    consumed: &mut u64,
    limits: &ArchiveLimits,
) -> Result<Option<Sheet>> {
    let entries = archive.len();
    let file = archive.by_index(index)?;
    if file.is_dir() {
        return Ok(None);
    }
    let path = file.name().to_string();
    let Some(delimiter) = sheet_format(&path) else {
        warn!(entry = %path, "Skipping unsupported archive entry");
        return Ok(None);
    };

    let budget = limits.max_total_bytes.saturating_sub(*consumed);
    let Some(bytes) = read_bounded(file, budget)? else {
        return Err(limits.too_large(entries, limits.max_total_bytes.saturating_add(1)));
    };
    *consumed += bytes.len() as u64;
    debug!(entry = %path, bytes = bytes.len(), "Inflated archive entry");

    Ok(Some(Sheet {
        name: sheet_name(&path),
        content: decode(bytes),
        delimiter,
    }))
}

/// Unpack `bytes` (named `name`) into sheets, enforcing `limits`
pub fn unpack<'a>(bytes: &'a [u8], name: &str, limits: &ArchiveLimits) -> Result<Sheets<'a>> {
    let kind = ContainerKind::sniff(bytes, name);
    debug!(artifact = name, ?kind, bytes = bytes.len(), "Unpacking artifact");

    let source = match kind {
        ContainerKind::Zip => {
            let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
            check_zip_directory(&mut archive, limits)?;
            Source::Zip {
                archive,
                next: 0,
                consumed: 0,
                limits: *limits,
            }
        },
        ContainerKind::Gzip => Source::Buffered(unpack_gzip(bytes, name, limits)?.into_iter()),
        ContainerKind::Tar => Source::Buffered(unpack_tar(bytes, limits)?.into_iter()),
        ContainerKind::Plain => {
            Source::Buffered(plain_sheet(bytes.to_vec(), name, limits)?.into_iter())
        },
    };

    Ok(Sheets { source })
}

fn check_zip_directory(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    limits: &ArchiveLimits,
) -> Result<()> {
    let entries = archive.len();
    if entries > limits.max_entries {
        return Err(limits.too_large(entries, 0));
    }
    let mut declared: u64 = 0;
    for index in 0..entries {
        let file = archive.by_index_raw(index)?;
        declared = declared.saturating_add(file.size());
    }
    if declared > limits.max_total_bytes {
        return Err(limits.too_large(entries, declared));
    }
    Ok(())
}

fn plain_sheet(bytes: Vec<u8>, name: &str, limits: &ArchiveLimits) -> Result<Vec<Sheet>> {
    if bytes.len() as u64 > limits.max_total_bytes {
        return Err(limits.too_large(1, bytes.len() as u64));
    }
    // bare downloads without an extension are tried as CSV
    let delimiter = match sheet_format(name) {
        Some(delimiter) => delimiter,
        None if !name.contains('.') => b',',
        None => {
            warn!(artifact = name, "Unsupported sheet format");
            return Ok(Vec::new());
        },
    };
    Ok(vec![Sheet {
        name: sheet_name(name),
        content: decode(bytes),
        delimiter,
    }])
}

fn unpack_gzip(bytes: &[u8], name: &str, limits: &ArchiveLimits) -> Result<Vec<Sheet>> {
    let Some(inflated) = read_bounded(GzDecoder::new(bytes), limits.max_total_bytes)? else {
        return Err(limits.too_large(1, limits.max_total_bytes.saturating_add(1)));
    };
    if is_tar(&inflated) {
        return unpack_tar(&inflated, limits);
    }
    let lower = name.to_ascii_lowercase();
    let inner = if lower.ends_with(".gz") {
        &name[..name.len() - 3]
    } else {
        name
    };
    plain_sheet(inflated, inner, limits)
}

fn unpack_tar(bytes: &[u8], limits: &ArchiveLimits) -> Result<Vec<Sheet>> {
    let mut archive = tar::Archive::new(Cursor::new(bytes));
    let mut sheets = Vec::new();
    let mut entries = 0usize;
    let mut consumed: u64 = 0;

    for entry in archive.entries()? {
        let entry = entry?;
        entries += 1;
        if entries > limits.max_entries {
            return Err(limits.too_large(entries, consumed));
        }
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().to_string();
        let Some(delimiter) = sheet_format(&path) else {
            warn!(entry = %path, "Skipping unsupported archive entry");
            continue;
        };
        let declared = entry.header().size()?;
        if consumed.saturating_add(declared) > limits.max_total_bytes {
            return Err(limits.too_large(entries, consumed.saturating_add(declared)));
        }
        let budget = limits.max_total_bytes - consumed;
        let Some(data) = read_bounded(entry, budget)? else {
            return Err(limits.too_large(entries, limits.max_total_bytes.saturating_add(1)));
        };
        consumed += data.len() as u64;
        sheets.push(Sheet {
            name: sheet_name(&path),
            content: decode(data),
            delimiter,
        });
    }

    Ok(sheets)
}
