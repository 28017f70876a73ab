//! HTTP request handlers of the REST API, one module per resource.

mod commands;
mod files;
mod health;
mod sandboxes;
mod templates;
mod volumes;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use commands::*;
pub use files::*;
pub use health::*;
pub use sandboxes::*;
pub use templates::*;
pub use volumes::*;
