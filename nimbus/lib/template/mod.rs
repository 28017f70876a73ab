//! Templates: immutable root filesystem snapshots plus the settings sandboxes boot with.
//!
//! A [`TemplateSpec`] (written directly or parsed from a single-stage Dockerfile) is turned into
//! a snapshot generation by the [`TemplateBuilder`]. Rebuilding an alias adds a generation and
//! never touches earlier ones.

mod builder;
mod dockerfile;
mod readiness;
mod spec;
mod store;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use builder::*;
pub use dockerfile::*;
pub use readiness::*;
pub use spec::*;
pub use store::*;
