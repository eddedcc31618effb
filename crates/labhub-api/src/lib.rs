//! Protocol types for labhubd
//!
//! This crate defines the data shared by the daemon and its clients:
//! - The server record and its status state machine
//! - Commands (requests from clients)
//! - Responses
//! - Versioning

mod commands;
mod types;

pub use commands::*;
pub use types::*;

/// Current API version
pub const API_VERSION: u32 = 1;
