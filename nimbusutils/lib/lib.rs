//! `nimbusutils` is a library containing general utilities for the nimbus project.

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

pub mod error;
pub mod log;
pub mod path;
pub mod retry;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use error::*;
pub use log::*;
pub use path::*;
pub use retry::*;
