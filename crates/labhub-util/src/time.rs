//! Time utilities for labhubd
//!
//! All timestamps are UTC and exchanged as RFC 3339 strings.
//!
//! # Mock Time for Development
//!
//! In debug builds, the `LABHUB_MOCK_TIME` environment variable can be set
//! to override the system time for all time-sensitive operations. This is
//! useful for exercising the auto-destroy policy without waiting out real
//! inactivity windows.
//!
//! Format: RFC 3339 (e.g., `2025-12-25T14:30:00Z`)

use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::OnceLock;

use crate::{LabError, Result};

/// Environment variable name for mock time (debug builds only)
pub const MOCK_TIME_ENV_VAR: &str = "LABHUB_MOCK_TIME";

/// Offset between mock time and real time, fixed at first use so that
/// mock time advances naturally.
static MOCK_TIME_OFFSET: OnceLock<Option<chrono::Duration>> = OnceLock::new();

#[allow(clippy::disallowed_methods)] // This is the internal implementation that wraps Utc::now()
fn get_mock_time_offset() -> Option<chrono::Duration> {
    *MOCK_TIME_OFFSET.get_or_init(|| {
        #[cfg(debug_assertions)]
        {
            if let Ok(mock_time_str) = std::env::var(MOCK_TIME_ENV_VAR) {
                match DateTime::parse_from_rfc3339(&mock_time_str) {
                    Ok(mock_dt) => {
                        let offset = mock_dt.with_timezone(&Utc).signed_duration_since(Utc::now());
                        tracing::info!(
                            mock_time = %mock_time_str,
                            offset_secs = offset.num_seconds(),
                            "Mock time enabled"
                        );
                        return Some(offset);
                    }
                    Err(e) => {
                        tracing::warn!(
                            mock_time = %mock_time_str,
                            error = %e,
                            "Invalid mock time format, expected RFC 3339"
                        );
                    }
                }
            }
            None
        }
        #[cfg(not(debug_assertions))]
        {
            None
        }
    })
}

/// Returns whether mock time is currently active.
pub fn is_mock_time_active() -> bool {
    get_mock_time_offset().is_some()
}

/// Get the current UTC time, respecting mock time settings in debug builds.
#[allow(clippy::disallowed_methods)] // This is the wrapper that provides mock time support
pub fn now() -> DateTime<Utc> {
    let real_now = Utc::now();

    if let Some(offset) = get_mock_time_offset() {
        real_now + offset
    } else {
        real_now
    }
}

/// Format a timestamp the way it is persisted on server records.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a persisted RFC 3339 timestamp into UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LabError::TimestampParse {
            value: value.to_string(),
            message: e.to_string(),
        })
}

/// Whole minutes elapsed from `since` to `now`, clamped at zero.
pub fn minutes_between(since: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    now.signed_duration_since(since).num_minutes().max(0)
}
