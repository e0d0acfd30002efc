//! Revision-aware discovery
//!
//! Regional publishers re-issue a week's data as `..._R1.zip`,
//! `... (R2).csv`, `..._revised.zip` and similar. The matcher recognizes
//! those markers, extracts the revision number and strips the marker so the
//! revised file lands in the same identity family as the regular one.

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use tracing::debug;

use super::{file_stem, normalize_family, resolve_identities, Discovery};
use crate::config::SourceDescriptor;
use crate::error::Result;
use crate::models::Artifact;

#[derive(Debug, Clone)]
pub struct RevisionMatcher {
    patterns: Vec<Regex>,
}

impl RevisionMatcher {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Revision number of a file name; an unnumbered marker counts as 1
    pub fn detect(&self, name: &str) -> Option<u32> {
        let stem = file_stem(name);
        self.patterns.iter().find_map(|pattern| {
            pattern.captures(stem).map(|captures| {
                captures
                    .name("rev")
                    .and_then(|m| m.as_str().parse::<u32>().ok())
                    .filter(|rev| *rev > 0)
                    .unwrap_or(1)
            })
        })
    }

    /// Identity family with every revision marker removed
    pub fn family(&self, name: &str) -> String {
        let mut stem = file_stem(name).to_string();
        for pattern in &self.patterns {
            stem = pattern.replace_all(&stem, " ").into_owned();
        }
        normalize_family(&stem)
    }
}

/// Decorates another strategy with revision detection and tie-breaking
pub struct RevisionAware {
    inner: Box<dyn Discovery>,
    matcher: RevisionMatcher,
}

impl RevisionAware {
    pub fn new(inner: Box<dyn Discovery>, matcher: RevisionMatcher) -> Self {
        Self { inner, matcher }
    }

    /// Flag marked artifacts with their revision number
    ///
    /// An artifact the inner strategy already flagged keeps its family; only
    /// its revision number is raised to what the name says.
    pub fn apply(&self, mut artifact: Artifact) -> Artifact {
        let Some(revision) = self.matcher.detect(&artifact.name) else {
            return artifact;
        };
        match artifact.revision {
            Some(current) => artifact.revision = Some(current.max(revision)),
            None => {
                artifact.revision = Some(revision);
                artifact.family = self.matcher.family(&artifact.name);
            },
        }
        artifact
    }
}

#[async_trait]
impl Discovery for RevisionAware {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn discover(&self, descriptor: &SourceDescriptor, today: NaiveDate) -> Result<Vec<Artifact>> {
        let artifacts: Vec<Artifact> = self
            .inner
            .discover(descriptor, today)
            .await?
            .into_iter()
            .map(|artifact| self.apply(artifact))
            .collect();

        let revised = artifacts.iter().filter(|a| a.is_revised()).count();
        debug!(region = %descriptor.region, revised, total = artifacts.len(), "Revision markers applied");
        Ok(resolve_identities(artifacts))
    }
}
