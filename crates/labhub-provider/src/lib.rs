//! Cloud container provider interface for labhubd
//!
//! This crate defines the contract between the lifecycle core and the cloud
//! that hosts lab servers. It carries no cloud SDK itself; the simulated
//! provider stands in for development and tests.

mod descriptor;
mod simulated;
mod traits;

pub use descriptor::*;
pub use simulated::*;
pub use traits::*;
