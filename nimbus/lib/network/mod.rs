//! Egress rules and public exposure of guest ports.

mod exposure;
mod policy;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use exposure::*;
pub use policy::*;
