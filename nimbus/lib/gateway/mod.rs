//! Runs commands, file operations and terminals inside one sandbox.

mod command;
mod files;
mod gateway;
mod pty;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use command::*;
pub use files::*;
pub use gateway::*;
pub use pty::*;
