//! Scheduler Module
//!
//! Picks a backend for a request: capability and capacity filters over the
//! registry snapshot, a weighted ranking of the survivors, and an atomic
//! capacity reservation on the winner.

pub mod filters;
pub mod ledger;
pub mod selector;
pub mod weigher;

pub use filters::*;
pub use ledger::*;
pub use selector::*;
pub use weigher::*;
