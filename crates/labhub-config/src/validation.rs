//! Configuration validation

use crate::schema::RawConfig;
use thiserror::Error;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("auto_destroy.{field} must be greater than zero")]
    MustBePositive { field: &'static str },

    #[error("defaults.inactivity_duration_minutes must be greater than zero")]
    ZeroInactivity,

    #[error("service.{field} cannot be empty")]
    EmptyPath { field: &'static str },
}

/// Validate a raw configuration, collecting every problem found
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.auto_destroy.polling_interval_seconds == Some(0) {
        errors.push(ValidationError::MustBePositive {
            field: "polling_interval_seconds",
        });
    }

    if config.auto_destroy.max_restarts == Some(0) {
        errors.push(ValidationError::MustBePositive {
            field: "max_restarts",
        });
    }

    if config.defaults.inactivity_duration_minutes == Some(0) {
        errors.push(ValidationError::ZeroInactivity);
    }

    if let Some(path) = &config.service.socket_path
        && path.as_os_str().is_empty()
    {
        errors.push(ValidationError::EmptyPath {
            field: "socket_path",
        });
    }

    if let Some(path) = &config.service.data_dir
        && path.as_os_str().is_empty()
    {
        errors.push(ValidationError::EmptyPath { field: "data_dir" });
    }

    errors
}
