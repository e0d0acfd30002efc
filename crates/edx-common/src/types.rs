//! Common types used across EDX

use crate::error::EdxError;
use serde::{Deserialize, Serialize};

/// Identifier of one publishing region (e.g. `NRLDC`, `SRPC`)
///
/// Always stored upper-case; object-store paths and ledger files are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RegionCode(String);

impl RegionCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for RegionCode {
    type Err = EdxError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty()
            || !trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(EdxError::InvalidRegion(s.to_string()));
        }
        Ok(RegionCode(trimmed.to_ascii_uppercase()))
    }
}

impl TryFrom<String> for RegionCode {
    type Error = EdxError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RegionCode> for String {
    fn from(value: RegionCode) -> Self {
        value.0
    }
}

impl std::fmt::Display for RegionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
