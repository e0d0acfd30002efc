//! Freshness tracking
//!
//! Decides, against the region's ledger, whether a discovered artifact needs
//! processing, and records the outcome once it has been durably applied.

use chrono::Utc;
use edx_common::RegionCode;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;
use crate::ledger::{Commit, Ledger, LedgerEntry, LedgerState, Rejection};
use crate::models::{Artifact, StationKey};

/// Verdict of [`FreshnessTracker::assess`]
#[derive(Debug, Clone, PartialEq)]
pub enum Freshness {
    /// Identity never committed
    New,
    /// Identity committed with a different signature or file; the previous
    /// contribution must be removed before the new one is added
    Updated { previous: Commit },
    Unchanged,
    /// A higher revision of this identity is already applied
    SupersededByRevision { committed_revision: Option<u32> },
    /// Previously refused under the same archive limits
    Rejected,
}

impl Freshness {
    pub fn needs_processing(&self) -> bool {
        matches!(self, Freshness::New | Freshness::Updated { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Freshness::New => "new",
            Freshness::Updated { .. } => "updated",
            Freshness::Unchanged => "unchanged",
            Freshness::SupersededByRevision { .. } => "superseded",
            Freshness::Rejected => "rejected",
        }
    }
}

/// Region-scoped view over a [`Ledger`]
///
/// Holds the loaded state; every `commit`/`reject` writes it back in full.
pub struct FreshnessTracker {
    ledger: Arc<dyn Ledger>,
    state: LedgerState,
    limits: String,
}

impl FreshnessTracker {
    /// Load the region's ledger; corruption surfaces as `LedgerCorruption`
    pub async fn open(ledger: Arc<dyn Ledger>, region: &RegionCode, limits: impl Into<String>) -> Result<Self> {
        let state = ledger.load(region).await?;
        debug!(region = %region, entries = state.entries.len(), "Ledger loaded");
        Ok(Self::from_state(ledger, state, limits))
    }

    pub fn from_state(ledger: Arc<dyn Ledger>, state: LedgerState, limits: impl Into<String>) -> Self {
        Self {
            ledger,
            state,
            limits: limits.into(),
        }
    }

    pub fn region(&self) -> &RegionCode {
        &self.state.region
    }

    pub fn state(&self) -> &LedgerState {
        &self.state
    }

    pub fn entry(&self, artifact: &Artifact) -> Option<&LedgerEntry> {
        self.state.entries.get(&artifact.identity().key())
    }

    pub fn assess(&self, artifact: &Artifact) -> Freshness {
        let Some(entry) = self.entry(artifact) else {
            return Freshness::New;
        };

        if let Some(rejected) = &entry.rejected {
            if rejected.artifact == artifact.name
                && rejected.signature == artifact.signature
                && rejected.limits == self.limits
            {
                return Freshness::Rejected;
            }
        }

        match &entry.committed {
            None => Freshness::New,
            Some(commit) if artifact.revision_rank() < commit.revision_rank() => {
                Freshness::SupersededByRevision {
                    committed_revision: commit.revision,
                }
            },
            Some(commit)
                if commit.artifact == artifact.name
                    && commit.signature == artifact.signature
                    && commit.revision == artifact.revision =>
            {
                Freshness::Unchanged
            },
            Some(commit) => Freshness::Updated {
                previous: commit.clone(),
            },
        }
    }

    pub fn should_process(&self, artifact: &Artifact) -> bool {
        self.assess(artifact).needs_processing()
    }

    /// Build the commit record for an applied artifact without persisting it
    pub fn prepare_commit(artifact: &Artifact, stations: Vec<StationKey>, content_sha256: String) -> Commit {
        Commit {
            artifact: artifact.name.clone(),
            source_path: artifact.url.to_string(),
            signature: artifact.signature.clone(),
            revision: artifact.revision,
            committed_at: Utc::now(),
            stations,
            content_sha256,
        }
    }

    /// Persist a commit; call only after partitions and manifest are uploaded
    pub async fn commit(&mut self, artifact: &Artifact, commit: Commit) -> Result<()> {
        let key = artifact.identity().key();
        let mut next = self.state.clone();
        let entry = next.entries.entry(key.clone()).or_default();
        entry.committed = Some(commit);
        entry.rejected = None;

        self.ledger.store(&next).await?;
        self.state = next;
        info!(region = %self.state.region, identity = %key, artifact = %artifact.name, "Ledger committed");
        Ok(())
    }

    /// Record an archive-cap rejection; any earlier contribution stays in place
    pub async fn reject(&mut self, artifact: &Artifact, reason: impl Into<String>) -> Result<()> {
        let key = artifact.identity().key();
        let mut next = self.state.clone();
        let entry = next.entries.entry(key.clone()).or_default();
        entry.rejected = Some(Rejection {
            artifact: artifact.name.clone(),
            signature: artifact.signature.clone(),
            limits: self.limits.clone(),
            reason: reason.into(),
            rejected_at: Utc::now(),
        });

        self.ledger.store(&next).await?;
        self.state = next;
        info!(region = %self.state.region, identity = %key, artifact = %artifact.name, "Artifact rejection recorded");
        Ok(())
    }
}
