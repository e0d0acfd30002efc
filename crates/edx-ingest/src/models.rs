//! Core domain types shared by every pipeline stage

use chrono::{NaiveDate, NaiveDateTime};
use edx_common::RegionCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// Inclusive reporting window of an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Window {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Window {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if end < start {
            Self { start: end, end: start }
        } else {
            Self { start, end }
        }
    }

    pub fn single(day: NaiveDate) -> Self {
        Self { start: day, end: day }
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Value used to detect that remote content changed
///
/// Strong signatures come from `ETag` / `Last-Modified`; without either the
/// weak fallback is name plus size. Different variants never compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Signature {
    Strong {
        etag: Option<String>,
        last_modified: Option<String>,
    },
    Weak {
        name: String,
        size: Option<u64>,
    },
}

impl Signature {
    pub fn from_headers(
        etag: Option<String>,
        last_modified: Option<String>,
        name: &str,
        size: Option<u64>,
    ) -> Self {
        let etag = etag.filter(|v| !v.trim().is_empty());
        let last_modified = last_modified.filter(|v| !v.trim().is_empty());
        if etag.is_some() || last_modified.is_some() {
            Signature::Strong { etag, last_modified }
        } else {
            Signature::Weak {
                name: name.to_string(),
                size,
            }
        }
    }

    pub fn is_strong(&self) -> bool {
        matches!(self, Signature::Strong { .. })
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signature::Strong { etag, last_modified } => write!(
                f,
                "strong(etag={}, modified={})",
                etag.as_deref().unwrap_or("-"),
                last_modified.as_deref().unwrap_or("-")
            ),
            Signature::Weak { name, size } => match size {
                Some(size) => write!(f, "weak({}, {} bytes)", name, size),
                None => write!(f, "weak({})", name),
            },
        }
    }
}

/// Stable identity of an artifact: (region, window, revision family)
///
/// The family is the lower-cased file stem with revision markers removed, so
/// `X_R1.zip` and `X.zip` for one window share an identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArtifactIdentity {
    pub region: RegionCode,
    pub window: Window,
    pub family: String,
}

impl ArtifactIdentity {
    /// Ledger key, e.g. `NRLDC|2025-08-25|2025-08-31|weekly`
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.region, self.window.start, self.window.end, self.family
        )
    }
}

impl std::fmt::Display for ArtifactIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// One remote file instance discovered for a region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub region: RegionCode,
    pub url: Url,
    /// Last path segment, percent-decoded
    pub name: String,
    pub window: Window,
    pub family: String,
    /// `Some(n)` for revised files; an unnumbered "revised" marker counts as 1
    pub revision: Option<u32>,
    pub signature: Signature,
}

impl Artifact {
    pub fn identity(&self) -> ArtifactIdentity {
        ArtifactIdentity {
            region: self.region.clone(),
            window: self.window,
            family: self.family.clone(),
        }
    }

    pub fn is_revised(&self) -> bool {
        self.revision.is_some()
    }

    /// Rank used when several artifacts share an identity: regular < r1 < r2
    pub fn revision_rank(&self) -> u32 {
        self.revision.unwrap_or(0)
    }
}

/// Where a record came from
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Provenance {
    pub artifact: String,
    pub source_path: String,
    /// `ArtifactIdentity::key` of the contributing artifact
    pub identity: String,
    pub sheet: String,
}

/// Canonical measurement row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub timestamp: NaiveDateTime,
    /// Display form of the station name
    pub station: String,
    /// Named numeric measurements; `None` marks a missing value
    pub fields: BTreeMap<String, Option<f64>>,
    pub region: RegionCode,
    pub provenance: Provenance,
}

impl Record {
    pub fn station_key(&self) -> Option<StationKey> {
        StationKey::new(&self.station)
    }
}

/// Trim and collapse internal whitespace, keeping case
pub fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized station identity
///
/// Equivalent spellings (`" Station  A"`, `"station a"`) produce equal keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StationKey(String);

impl StationKey {
    /// `None` for names that are empty after trimming
    pub fn new(raw: &str) -> Option<Self> {
        let collapsed = collapse_whitespace(raw);
        if collapsed.is_empty() {
            None
        } else {
            Some(StationKey(collapsed.to_lowercase()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-system and object-key safe form, unique per key
    ///
    /// Alphanumerics are upper-cased and spaces become `_`; any other
    /// character is lossy, so a short digest of the key is appended.
    pub fn slug(&self) -> String {
        let mut lossy = false;
        let mut slug: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else if c == ' ' {
                    '_'
                } else {
                    lossy = true;
                    '-'
                }
            })
            .collect();
        if lossy {
            slug.push('~');
            slug.push_str(&edx_common::checksum::short_digest(&self.0)[..8]);
        }
        slug
    }
}

impl std::fmt::Display for StationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_station_key_normalization() {
        let a = StationKey::new("  Rihand   STPS ").unwrap();
        let b = StationKey::new("rihand stps").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "rihand stps");
        assert!(StationKey::new("   ").is_none());
    }

    #[test]
    fn test_station_slug_is_injective_for_lossy_names() {
        let plain = StationKey::new("Station A").unwrap();
        assert_eq!(plain.slug(), "STATION_A");
        let dashed = StationKey::new("A-B").unwrap();
        let slashed = StationKey::new("A/B").unwrap();
        assert_ne!(dashed.slug(), slashed.slug());
        assert!(dashed.slug().starts_with("A-B~"));
    }

    #[test]
    fn test_signature_prefers_strong() {
        let strong = Signature::from_headers(Some("\"abc\"".into()), None, "a.zip", Some(10));
        assert!(strong.is_strong());
        let weak = Signature::from_headers(Some("  ".into()), None, "a.zip", Some(10));
        assert_eq!(
            weak,
            Signature::Weak {
                name: "a.zip".into(),
                size: Some(10)
            }
        );
    }

    #[test]
    fn test_window_orders_bounds() {
        let w = Window::new(date("2025-08-31"), date("2025-08-25"));
        assert_eq!(w.start, date("2025-08-25"));
        assert_eq!(w.to_string(), "2025-08-25..2025-08-31");
    }

    #[test]
    fn test_identity_key() {
        let identity = ArtifactIdentity {
            region: "nrldc".parse().unwrap(),
            window: Window::new(date("2025-08-25"), date("2025-08-31")),
            family: "window".into(),
        };
        assert_eq!(identity.key(), "NRLDC|2025-08-25|2025-08-31|window");
    }
}
