//! Ad placement configuration.
//!
//! A JSON document maps each placement to the provider units that may fill
//! it, together with the global daily limits:
//!
//! ```json
//! {
//!   "showLimit": 20,
//!   "clickLimit": 3,
//!   "placements": {
//!     "interstitial": [{ "priority": 2, "providerId": "unit-b" }, { "priority": 1, "providerId": "unit-a" }]
//!   }
//! }
//! ```
//!
//! The document is read once (bundled copy or host-supplied file) and then
//! cached in the key-value store for the rest of the session.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::AdKind;
use crate::error::{ConfigError, CoreError};

const BUNDLED_CONFIG: &str = include_str!("../../assets/ad_config.json");

/// One provider unit eligible for a placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEntry {
    pub priority: i32,
    pub provider_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdConfig {
    /// Impressions allowed per calendar day. Absent means zero.
    #[serde(default)]
    pub show_limit: Option<u32>,
    /// Clicks allowed per calendar day. Absent means zero.
    #[serde(default)]
    pub click_limit: Option<u32>,
    #[serde(default)]
    pub placements: BTreeMap<AdKind, Vec<ProviderEntry>>,
}

impl AdConfig {
    /// The configuration compiled into the crate.
    ///
    /// # Errors
    /// Returns an error if the bundled document does not decode.
    pub fn bundled() -> Result<Self, serde_json::Error> {
        Self::from_json(BUNDLED_CONFIG)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Read a configuration document from disk.
    ///
    /// # Errors
    /// Returns [`ConfigError::LoadFailed`] if the file is unreadable or not
    /// a valid document.
    pub fn load_file(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_json(&content).map_err(|e| {
            ConfigError::LoadFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Waterfall order for a placement: highest priority first.
    ///
    /// Entries with equal priority keep their document order.
    pub fn providers_for(&self, kind: AdKind) -> Vec<ProviderEntry> {
        let mut entries = self.placements.get(&kind).cloned().unwrap_or_default();
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        entries
    }

    pub fn show_limit(&self) -> u32 {
        self.show_limit.unwrap_or(0)
    }

    pub fn click_limit(&self) -> u32 {
        self.click_limit.unwrap_or(0)
    }
}
