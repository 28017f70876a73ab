//! Configuration types and helpers.

mod defaults;
mod nimbus;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use nimbus::*;
