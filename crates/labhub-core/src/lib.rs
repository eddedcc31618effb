//! Core lifecycle logic for labhubd
//!
//! This crate contains:
//! - The repository contract shared by every component (persistence + provider)
//! - The lifecycle service enacting user intent (register, deploy, update, destroy, heartbeat)
//! - The auto-destroy monitor enacting the idle policy on a timer
//! - A bounded restart supervisor for the monitor

mod lifecycle;
mod monitor;
mod outcome;
mod repository;
mod supervisor;

pub use lifecycle::*;
pub use monitor::*;
pub use outcome::*;
pub use repository::*;
pub use supervisor::*;
