//! Utility functions and types.

mod env;
mod fs;
mod id;
mod page;
mod path;
mod time;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use env::*;
pub use fs::*;
pub use id::*;
pub use page::*;
pub use path::*;
pub use time::*;
