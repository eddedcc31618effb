//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// Service-level settings
    #[serde(default)]
    pub service: RawServiceConfig,

    /// Auto-destroy monitor settings
    #[serde(default)]
    pub auto_destroy: RawAutoDestroyConfig,

    /// Policy applied to newly registered servers
    #[serde(default)]
    pub defaults: RawServerDefaults,
}

/// Service-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawServiceConfig {
    /// IPC socket path
    pub socket_path: Option<PathBuf>,

    /// Data directory for the server database
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawAutoDestroyConfig {
    /// Start the monitor at all
    pub enabled: Option<bool>,

    /// Scan cadence
    pub polling_interval_seconds: Option<u64>,

    /// Supervisor restart budget before the monitor stays down
    pub max_restarts: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawServerDefaults {
    pub auto_destroy: Option<bool>,
    pub inactivity_duration_minutes: Option<u32>,
}
