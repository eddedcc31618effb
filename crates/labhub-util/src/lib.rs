//! Shared utilities for labhubd
//!
//! This crate provides:
//! - ID types (SubscriptionId, UserPrincipalName, UserPrincipalId, ClientId)
//! - Wall-clock helpers (RFC 3339 parsing/formatting, mock time)
//! - Error types
//! - Default paths for socket, data, and config files

mod error;
mod ids;
mod paths;
mod time;

pub use error::*;
pub use ids::*;
pub use paths::*;
pub use time::*;
