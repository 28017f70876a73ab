//! Sandbox lifecycle: creation, expiry, pause and resume, and teardown.

mod create;
mod entry;
mod host;
mod lifecycle;
mod orchestrator;
mod sandbox;
mod state;
mod status;
mod volumes;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub(crate) use entry::*;
pub use orchestrator::*;
pub use sandbox::*;
pub use state::*;
