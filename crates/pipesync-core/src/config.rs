//! Configuration module for Pipesync.
//!
//! Typed configuration structs mapping to the YAML configuration file,
//! with loading, defaults, and helpers for the pieces other crates consume
//! (the field mapping, the rate-budget parameters).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::mapping::FieldMapping;

/// Top-level configuration for Pipesync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub remote: RemoteConfig,
    pub rate_budget: RateBudgetConfig,
    pub conflicts: ConflictsConfig,
    pub mapping: MappingConfig,
    pub store: StoreConfig,
    pub control: ControlConfig,
    pub logging: LoggingConfig,
}

/// Synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between scheduled incremental runs.
    pub interval_secs: u64,
    /// Records per fetch page (also the chunk commit size).
    pub page_size: u32,
}

/// Remote CRM API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the CRM API, e.g. `https://crm.example.com/api/v2`.
    pub base_url: String,
    /// Bearer token for the CRM API. Provisioning it is out of scope here;
    /// operators inject it via the config file or environment.
    pub api_token: String,
    /// Maximum records per `updateRecords` push-back call.
    pub push_batch_size: u32,
    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

/// Remote API call-rate budget settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateBudgetConfig {
    /// Calls allowed per window, per the remote API's documented limit.
    pub window_limit: u32,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Remaining-budget percentage below which calls are proactively paced.
    pub low_water_percent: u8,
    /// Delay inserted per call while below the low-water mark, in ms.
    pub pacing_delay_ms: u64,
    /// How long `acquire` may wait for budget before erroring, in seconds.
    pub acquire_timeout_secs: u64,
}

/// Conflict resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictsConfig {
    /// Default policy: `remote_wins`, `local_wins`, or `manual_only`.
    pub default_policy: String,
}

/// Remote→local field mapping table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// Version pinned by sessions that run with this mapping.
    pub version: u32,
    /// remote field name → local field name.
    pub fields: BTreeMap<String, String>,
}

/// Local store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
}

/// Control interface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Listen address for the HTTP control interface.
    pub listen_addr: String,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
}

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/pipesync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("pipesync")
            .join("config.yaml")
    }

    /// Builds the [`FieldMapping`] sessions pin at start.
    pub fn field_mapping(&self) -> FieldMapping {
        FieldMapping::new(self.mapping.version, self.mapping.fields.clone())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            page_size: 5_000,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8600/api/v2".to_string(),
            api_token: String::new(),
            push_batch_size: 100,
            request_timeout_secs: 60,
        }
    }
}

impl Default for RateBudgetConfig {
    fn default() -> Self {
        Self {
            window_limit: 1_000,
            window_secs: 600,
            low_water_percent: 20,
            pacing_delay_ms: 500,
            acquire_timeout_secs: 900,
        }
    }
}

impl Default for ConflictsConfig {
    fn default() -> Self {
        Self {
            default_policy: "manual_only".to_string(),
        }
    }
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            version: 1,
            fields: BTreeMap::new(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("pipesync")
                .join("pipesync.db"),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8585".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sync.page_size, 5_000);
        assert_eq!(config.remote.push_batch_size, 100);
        assert_eq!(config.rate_budget.low_water_percent, 20);
        assert_eq!(config.conflicts.default_policy, "manual_only");
        assert_eq!(config.mapping.version, 1);
    }

    #[test]
    fn test_load_partial_yaml_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "sync:\n  interval_secs: 60\nmapping:\n  version: 4\n  fields:\n    StageName: stage\n"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.sync.interval_secs, 60);
        // Unspecified field falls back to the default
        assert_eq!(config.sync.page_size, 5_000);
        assert_eq!(config.mapping.version, 4);

        let mapping = config.field_mapping();
        assert_eq!(mapping.version(), 4);
        assert_eq!(mapping.local_name("StageName"), "stage");
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let config = Config::load_or_default(Path::new("/nonexistent/pipesync.yaml"));
        assert_eq!(config.sync.page_size, 5_000);
    }
}
