//! Source discovery
//!
//! Enumerates candidate artifacts for one region. Each region selects a
//! strategy through its [`SourceDescriptor`]:
//!
//! - [`TableScrape`] reads hyperlinks out of an index page table
//! - [`PatternProbe`] generates dated URLs and confirms them with a probe
//! - [`RevisionAware`] wraps either and flags revised files
//!
//! Whatever the strategy, [`discover`] returns artifacts inside the horizon,
//! one per identity (the highest revision wins), in window order.
//!
//! # Example
//!
//! ```rust,ignore
//! let remote: Arc<dyn RemoteSource> = Arc::new(HttpRemote::new(&config.http, config.retry.clone())?);
//! let artifacts = discovery::discover(descriptor, remote, Local::now().date_naive()).await?;
//! for artifact in &artifacts {
//!     println!("{} {}", artifact.window, artifact.url);
//! }
//! ```

pub mod pattern_probe;
pub mod revision;
pub mod table_scrape;

pub use pattern_probe::PatternProbe;
pub use revision::{RevisionAware, RevisionMatcher};
pub use table_scrape::TableScrape;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use url::Url;

use crate::config::{DiscoveryStrategy, SourceDescriptor, WindowPattern};
use crate::error::Result;
use crate::models::{Artifact, Signature, Window};
use crate::remote::{RemoteMeta, RemoteSource};

#[async_trait]
pub trait Discovery: Send + Sync {
    fn name(&self) -> &'static str;

    /// Candidate artifacts; bad entries are logged and skipped
    async fn discover(&self, descriptor: &SourceDescriptor, today: NaiveDate) -> Result<Vec<Artifact>>;
}

/// Build the strategy configured for a region
pub fn strategy_for(
    descriptor: &SourceDescriptor,
    remote: Arc<dyn RemoteSource>,
) -> Result<Box<dyn Discovery>> {
    let base: Box<dyn Discovery> = match &descriptor.strategy {
        DiscoveryStrategy::TableScrape { .. } => Box::new(TableScrape::new(descriptor, remote)?),
        DiscoveryStrategy::PatternProbe { .. } => Box::new(PatternProbe::new(descriptor, remote)?),
    };

    if descriptor.revision_aware {
        Ok(Box::new(RevisionAware::new(base, RevisionMatcher::new(&descriptor.revision_patterns)?)))
    } else {
        Ok(base)
    }
}

/// Discover a region's artifacts as of `today`
#[instrument(skip(descriptor, remote), fields(region = %descriptor.region, strategy = descriptor.strategy.name()))]
pub async fn discover(
    descriptor: &SourceDescriptor,
    remote: Arc<dyn RemoteSource>,
    today: NaiveDate,
) -> Result<Vec<Artifact>> {
    let strategy = strategy_for(descriptor, remote)?;
    let found = strategy.discover(descriptor, today).await?;
    let found_count = found.len();

    let cutoff = horizon_cutoff(today, descriptor.horizon_days);
    let artifacts = resolve_identities(found.into_iter().filter(|a| a.window.end >= cutoff).collect());

    info!(
        found = found_count,
        kept = artifacts.len(),
        cutoff = %cutoff,
        "Discovered {} artifacts using {}",
        artifacts.len(),
        strategy.name()
    );
    Ok(artifacts)
}

/// Earliest window end still inside the horizon
pub fn horizon_cutoff(today: NaiveDate, horizon_days: u32) -> NaiveDate {
    today - Duration::days(i64::from(horizon_days))
}

/// Keep one artifact per identity and order by window
///
/// Within an identity the highest revision wins; between equal ranks the
/// first discovered is kept.
pub fn resolve_identities(artifacts: Vec<Artifact>) -> Vec<Artifact> {
    let mut winners: HashMap<String, Artifact> = HashMap::new();
    for artifact in artifacts {
        let key = artifact.identity().key();
        match winners.get(&key) {
            Some(current) if current.revision_rank() >= artifact.revision_rank() => {
                debug!(identity = %key, dropped = %artifact.name, kept = %current.name, "Dropping outranked artifact");
            },
            Some(current) => {
                debug!(identity = %key, dropped = %current.name, kept = %artifact.name, "Revision supersedes earlier artifact");
                winners.insert(key, artifact);
            },
            None => {
                winners.insert(key, artifact);
            },
        }
    }

    let mut resolved: Vec<Artifact> = winners.into_values().collect();
    resolved.sort_by(|a, b| {
        (a.window.start, a.window.end, &a.family, a.revision_rank())
            .cmp(&(b.window.start, b.window.end, &b.family, b.revision_rank()))
    });
    resolved
}

/// Build an artifact from a confirmed remote location
pub(crate) fn confirmed_artifact(
    descriptor: &SourceDescriptor,
    url: Url,
    name: String,
    window: Window,
    meta: &RemoteMeta,
) -> Artifact {
    let signature = Signature::from_headers(meta.etag.clone(), meta.last_modified.clone(), &name, meta.size);
    Artifact {
        region: descriptor.region.clone(),
        family: plain_family(&name),
        url,
        name,
        window,
        revision: None,
        signature,
    }
}

// ============================================================================
// Windows
// ============================================================================

/// Extracts reporting windows from file names or table text
#[derive(Debug, Clone)]
pub struct WindowParser {
    patterns: Vec<(Regex, String)>,
}

impl WindowParser {
    pub fn new(patterns: &[WindowPattern]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| Ok((Regex::new(&p.regex)?, p.format.clone())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// First pattern (in configured order) producing valid dates wins
    pub fn parse(&self, text: &str) -> Option<Window> {
        for (regex, format) in &self.patterns {
            for captures in regex.captures_iter(text) {
                let date = |group: &str| {
                    captures
                        .name(group)
                        .and_then(|m| NaiveDate::parse_from_str(m.as_str(), format).ok())
                };
                let Some(start) = date("start") else {
                    continue;
                };
                let end = match captures.name("end") {
                    Some(_) => match date("end") {
                        Some(end) => end,
                        None => continue,
                    },
                    None => start,
                };
                return Some(Window::new(start, end));
            }
        }
        None
    }
}

// ============================================================================
// Names and families
// ============================================================================

const KNOWN_EXTENSIONS: &[&str] = &[
    "zip", "gz", "tgz", "tar", "csv", "tsv", "txt", "xls", "xlsx", "xlsm", "pdf",
];

/// Last path segment of a URL, percent-decoded
pub fn file_name(url: &Url) -> Option<String> {
    let segment = url.path_segments().and_then(|mut s| s.next_back())?;
    if segment.is_empty() {
        return None;
    }
    Some(
        urlencoding::decode(segment)
            .map(|decoded| decoded.into_owned())
            .unwrap_or_else(|_| segment.to_string()),
    )
}

/// Name without its archive/sheet extensions (`a.csv.gz` -> `a`)
pub fn file_stem(name: &str) -> &str {
    let mut stem = name;
    while let Some((head, ext)) = stem.rsplit_once('.') {
        if head.is_empty() || !KNOWN_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            break;
        }
        stem = head;
    }
    stem
}

/// Lower-case alphanumeric runs joined by `_`
pub fn normalize_family(stem: &str) -> String {
    let mut family = String::with_capacity(stem.len());
    let mut pending_separator = false;
    for c in stem.chars() {
        if c.is_alphanumeric() {
            if pending_separator && !family.is_empty() {
                family.push('_');
            }
            pending_separator = false;
            family.extend(c.to_lowercase());
        } else {
            pending_separator = true;
        }
    }
    if family.is_empty() {
        family.push_str("artifact");
    }
    family
}

/// Family of a name carrying no revision marker
pub fn plain_family(name: &str) -> String {
    normalize_family(file_stem(name))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::default_window_patterns;
    use edx_common::RegionCode;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn parser() -> WindowParser {
        WindowParser::new(&default_window_patterns()).unwrap()
    }

    #[test]
    fn test_window_formats_seen_in_the_wild() {
        let parser = parser();
        assert_eq!(
            parser.parse("WINDOW-2025-08-25_to_2025-08-31.zip"),
            Some(Window::new(date(2025, 8, 25), date(2025, 8, 31)))
        );
        assert_eq!(
            parser.parse("110825-170825(WK-20)"),
            Some(Window::new(date(2025, 8, 11), date(2025, 8, 17)))
        );
        assert_eq!(
            parser.parse("Week: 25.08.2025 to 31.08.2025"),
            Some(Window::new(date(2025, 8, 25), date(2025, 8, 31)))
        );
        assert_eq!(parser.parse("dsm_250825.csv"), Some(Window::single(date(2025, 8, 25))));
        assert_eq!(parser.parse("readme.txt"), None);
    }

    #[test]
    fn test_invalid_dates_fall_through() {
        // 99 is not a month, so the pair is rejected and nothing else matches
        assert_eq!(parser().parse("329925-339925"), None);
    }

    #[test]
    fn test_file_name_and_family() {
        let url = Url::parse("https://example.test/files/DSM%20Week%2034.zip?x=1").unwrap();
        assert_eq!(file_name(&url).as_deref(), Some("DSM Week 34.zip"));
        assert_eq!(file_name(&Url::parse("https://example.test/dir/").unwrap()), None);

        assert_eq!(file_stem("data.csv.gz"), "data");
        assert_eq!(file_stem("v1.2 notes"), "v1.2 notes");
        assert_eq!(plain_family("WINDOW-2025-08-25_to_2025-08-31.zip"), "window_2025_08_25_to_2025_08_31");
        assert_eq!(plain_family("__.zip"), "artifact");
    }

    fn artifact(name: &str, start: u32, revision: Option<u32>) -> Artifact {
        let region: RegionCode = "wrpc".parse().unwrap();
        Artifact {
            region,
            url: Url::parse(&format!("https://example.test/{}", name)).unwrap(),
            name: name.to_string(),
            window: Window::new(date(2025, 8, start), date(2025, 8, start + 6)),
            family: "week".into(),
            revision,
            signature: Signature::from_headers(None, None, name, None),
        }
    }

    #[test]
    fn test_revision_wins_regardless_of_order() {
        let resolved = resolve_identities(vec![
            artifact("week_R1.zip", 18, Some(1)),
            artifact("week.zip", 18, None),
            artifact("older.zip", 11, None),
            artifact("week_R2.zip", 18, Some(2)),
        ]);
        let names: Vec<_> = resolved.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["older.zip", "week_R2.zip"]);
    }

    #[test]
    fn test_horizon_cutoff() {
        assert_eq!(horizon_cutoff(date(2025, 9, 3), 7), date(2025, 8, 27));
    }
}
