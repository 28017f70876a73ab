//! `nimbusutils::log` is a module containing logging utilities for the nimbus project.

mod rotating;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default maximum size of a log file before it is rotated (10 MiB).
pub const DEFAULT_LOG_MAX_SIZE: u64 = 10 * 1024 * 1024;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use rotating::*;
