//! Volume Module
//!
//! Authoritative lifecycle state of every volume and snapshot, and the
//! transition rules that guard it.

pub mod machine;
pub mod model;

pub use machine::*;
pub use model::*;
