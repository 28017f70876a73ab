//! The control channel into a sandbox guest.
//!
//! [`GuestAgent`] is what the execution gateway talks to. A micro-VM backend implements it over
//! its vsock control channel; [`local::LocalAgent`] implements it with host processes and a
//! per-sandbox directory, which is what tests and single-host development run against.

mod agent;
mod entry;
mod types;

pub mod local;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use agent::*;
pub use entry::*;
pub use types::*;
