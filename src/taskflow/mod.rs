//! Task-Flow Engine
//!
//! Runs a linear sequence of reversible steps. Progress is persisted after
//! every transition so any worker can resume a flow a crashed worker left
//! behind. A forward failure unwinds the committed steps in reverse order.

pub mod context;
pub mod engine;
pub mod record;
pub mod step;

pub use context::*;
pub use engine::*;
pub use record::*;
pub use step::*;
