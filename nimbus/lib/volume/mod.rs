//! Persistent volumes that outlive the sandboxes mounting them.

mod name;
mod store;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use name::*;
pub use store::*;
