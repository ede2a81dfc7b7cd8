//! Manager configuration.
//!
//! Loaded from TOML or built in code. Every field has a default, so a
//! config file only needs the values it changes.

use crate::error::{DrmError, DrmResult};
use mediadrm_types::HdcpLevel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What to do when a session asks for a level the scheme cannot run at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelFallback {
    /// Below the lowest level: upgrade to the lowest. Unsupported level in
    /// range: use the next lower supported level.
    #[default]
    Nearest,
    /// Reject anything the scheme does not support exactly.
    Strict,
}

/// What to do when the session limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityPolicy {
    /// Fail the open with `ResourceBusy`.
    #[default]
    Reject,
    /// Reclaim the oldest open session and mark it lost.
    ReclaimOldest,
}

/// Configuration for the DRM manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrmConfig {
    /// Device-wide limit on concurrently open sessions.
    pub max_sessions: usize,
    pub level_fallback: LevelFallback,
    pub capacity_policy: CapacityPolicy,
    /// Keys expiring within this many seconds are due for renewal.
    pub renewal_window_secs: u64,
    /// Default URL reported with key requests.
    pub license_url: String,
    /// Default URL reported with provisioning requests.
    pub provisioning_url: String,
    /// Ledger database file. `None` keeps the ledger in memory.
    pub ledger_path: Option<PathBuf>,
    pub connected_hdcp: HdcpLevel,
    pub max_hdcp: HdcpLevel,
    pub vendor: String,
    pub version: String,
    pub description: String,
}

impl Default for DrmConfig {
    fn default() -> Self {
        Self {
            max_sessions: 16,
            level_fallback: LevelFallback::default(),
            capacity_policy: CapacityPolicy::default(),
            renewal_window_secs: 300,
            license_url: String::new(),
            provisioning_url: String::new(),
            ledger_path: None,
            connected_hdcp: HdcpLevel::Unknown,
            max_hdcp: HdcpLevel::Unknown,
            vendor: "mediadrm".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "Software DRM session manager".to_string(),
        }
    }
}

impl DrmConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(s: &str) -> DrmResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| DrmError::invalid(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> DrmResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DrmError::invalid(format!("failed to read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// The renewal window as a duration.
    pub fn renewal_window(&self) -> chrono::TimeDelta {
        i64::try_from(self.renewal_window_secs)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .unwrap_or(chrono::TimeDelta::MAX)
    }

    /// Checks values that the type system cannot.
    pub fn validate(&self) -> DrmResult<()> {
        if self.max_sessions == 0 {
            return Err(DrmError::invalid("max_sessions must be at least 1"));
        }
        Ok(())
    }
}
