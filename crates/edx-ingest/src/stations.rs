//! Station directory: state and regional group per known station
//!
//! Loaded from the region's `[[region.stations]]` table and applied when
//! master datasets are built. Unknown stations simply get empty columns.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::models::StationKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationInfo {
    pub name: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub regional_group: Option<String>,
    /// Alternate spellings seen in source sheets
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StationDirectory {
    by_key: HashMap<StationKey, StationInfo>,
}

impl StationDirectory {
    pub fn new(stations: &[StationInfo]) -> Self {
        let mut by_key = HashMap::new();
        for info in stations {
            for name in std::iter::once(&info.name).chain(&info.aliases) {
                let Some(key) = StationKey::new(name) else {
                    continue;
                };
                if let Some(previous) = by_key.insert(key.clone(), info.clone()) {
                    if previous != *info {
                        warn!(station = %key, "Station listed twice in directory; last entry wins");
                    }
                }
            }
        }
        Self { by_key }
    }

    pub fn lookup(&self, key: &StationKey) -> Option<&StationInfo> {
        self.by_key.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_alias_and_case() {
        let directory = StationDirectory::new(&[StationInfo {
            name: "Rihand STPS".into(),
            state: Some("Uttar Pradesh".into()),
            regional_group: Some("NR".into()),
            aliases: vec!["RIHAND-III".into()],
        }]);

        let by_name = directory.lookup(&StationKey::new("rihand  stps").unwrap()).unwrap();
        assert_eq!(by_name.state.as_deref(), Some("Uttar Pradesh"));
        assert!(directory.lookup(&StationKey::new("Rihand-III").unwrap()).is_some());
        assert!(directory.lookup(&StationKey::new("Dadri").unwrap()).is_none());
    }
}
