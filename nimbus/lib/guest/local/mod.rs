//! A guest agent backed by host processes and a per-sandbox directory.
//!
//! This backend gives no isolation. Processes run on the host as the mapped user, and their
//! working directory, `HOME` and `PWD` are guest paths resolved into the sandbox root or the
//! storage mounted there. Paths relative to the working directory therefore land where a guest
//! would put them, including on volumes, while absolute paths in command lines still refer to
//! the host. File operations are confined to the sandbox root and its mounts.

mod agent;
mod fs;
mod process;
mod pty;
mod watch;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use agent::*;
