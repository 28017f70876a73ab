//! Per-team admission control for compute and storage.

mod ledger;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use ledger::*;
