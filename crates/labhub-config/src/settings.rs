//! Validated configuration structures

use crate::schema::{RawAutoDestroyConfig, RawConfig, RawServerDefaults, RawServiceConfig};
use labhub_api::ServerPolicy;
use labhub_util::{data_dir_without_env, socket_path_without_env};
use std::path::PathBuf;
use std::time::Duration;

/// Default scan cadence: once a minute
pub const DEFAULT_POLLING_INTERVAL_SECS: u64 = 60;

/// Default supervisor restart budget
pub const DEFAULT_MAX_RESTARTS: u32 = 100;

/// Validated configuration ready for use by the daemon
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    pub service: ServiceConfig,
    pub auto_destroy: AutoDestroyConfig,
    /// Policy given to servers at registration
    pub defaults: ServerPolicy,
}

impl HubConfig {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> Self {
        Self {
            service: ServiceConfig::from_raw(raw.service),
            auto_destroy: AutoDestroyConfig::from_raw(raw.auto_destroy),
            defaults: convert_defaults(raw.defaults),
        }
    }
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
}

impl ServiceConfig {
    fn from_raw(raw: RawServiceConfig) -> Self {
        Self {
            socket_path: raw.socket_path.unwrap_or_else(socket_path_without_env),
            data_dir: raw.data_dir.unwrap_or_else(data_dir_without_env),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from_raw(RawServiceConfig::default())
    }
}

/// Auto-destroy monitor configuration
#[derive(Debug, Clone)]
pub struct AutoDestroyConfig {
    pub enabled: bool,
    pub polling_interval: Duration,
    pub max_restarts: u32,
}

impl AutoDestroyConfig {
    fn from_raw(raw: RawAutoDestroyConfig) -> Self {
        Self {
            enabled: raw.enabled.unwrap_or(true),
            polling_interval: Duration::from_secs(
                raw.polling_interval_seconds
                    .unwrap_or(DEFAULT_POLLING_INTERVAL_SECS),
            ),
            max_restarts: raw.max_restarts.unwrap_or(DEFAULT_MAX_RESTARTS),
        }
    }
}

impl Default for AutoDestroyConfig {
    fn default() -> Self {
        Self::from_raw(RawAutoDestroyConfig::default())
    }
}

fn convert_defaults(raw: RawServerDefaults) -> ServerPolicy {
    let fallback = ServerPolicy::default();
    ServerPolicy {
        auto_destroy: raw.auto_destroy.unwrap_or(fallback.auto_destroy),
        inactivity_duration_in_minutes: raw
            .inactivity_duration_minutes
            .unwrap_or(fallback.inactivity_duration_in_minutes),
    }
}
