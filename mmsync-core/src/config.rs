//! Configuration types
//!
//! Loaded from TOML. Every field is required in the file; code that wants
//! the stock values uses [`SyncConfig::default_client`].

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What the cache does when a write arrives that was issued before the
/// write currently stored in the same canonical slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleWritePolicy {
    /// Whichever response completes last overwrites the slot.
    LastCompletionWins,
    /// Writes carrying an older sequence number than the slot are dropped.
    RejectOlder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    pub api_base_url: String,
    /// Transport timeout for single requests.
    pub request_timeout_ms: u64,
    /// Upper bound for one (project, ref) partition of a bulk save.
    pub bulk_timeout_ms: u64,
    /// Pause before a single-element save so embedded editors can flush.
    pub save_grace_delay_ms: u64,
    /// Silent resubmits allowed per save when a conflict does not overlap.
    pub max_auto_rebase: u32,
    pub max_concurrent_requests: usize,
    pub stale_write_policy: StaleWritePolicy,
    /// Provenance marker attached to every write.
    pub source: String,
    pub tracker_channel_capacity: usize,
}

impl SyncConfig {
    /// Stock client configuration for the given repository URL.
    ///
    /// This centralizes the defaults so callers do not hardcode policy.
    pub fn default_client(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            request_timeout_ms: 30_000,
            bulk_timeout_ms: 60_000,
            save_grace_delay_ms: 1_000,
            max_auto_rebase: 1,
            max_concurrent_requests: 6,
            stale_write_policy: StaleWritePolicy::RejectOlder,
            source: "mmsync".to_string(),
            tracker_channel_capacity: 256,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base_url.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "api_base_url".to_string(),
            });
        }
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://"))
        {
            return Err(invalid("api_base_url", &self.api_base_url, "must be an http(s) url"));
        }
        if self.request_timeout_ms == 0 {
            return Err(invalid("request_timeout_ms", "0", "must be > 0"));
        }
        if self.bulk_timeout_ms == 0 {
            return Err(invalid("bulk_timeout_ms", "0", "must be > 0"));
        }
        if self.max_concurrent_requests == 0 {
            return Err(invalid("max_concurrent_requests", "0", "must be > 0"));
        }
        if self.tracker_channel_capacity == 0 {
            return Err(invalid("tracker_channel_capacity", "0", "must be > 0"));
        }
        if self.source.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "source".to_string(),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn bulk_timeout(&self) -> Duration {
        Duration::from_millis(self.bulk_timeout_ms)
    }

    pub fn save_grace_delay(&self) -> Duration {
        Duration::from_millis(self.save_grace_delay_ms)
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
