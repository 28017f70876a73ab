//! The REST API.
//!
//! Every route except `/health` goes through [`auth_middleware`], which attaches the [`Team`] a
//! request acts for, and then through the per-team [`rate_limit_middleware`]. Handlers translate
//! [`NimbusError`](crate::NimbusError)s into an [`ErrorResponse`] with a status derived from the
//! error kind.

mod auth;
mod error;
mod rate_limit;
mod routes;
mod serve;
mod state;
mod types;

pub mod handlers;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use auth::*;
pub use error::*;
pub use rate_limit::*;
pub use routes::*;
pub use serve::*;
pub use state::*;
pub use types::*;
