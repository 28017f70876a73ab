//! Micro-VM provisioning.

mod backend;
mod local;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use backend::*;
pub use local::*;
