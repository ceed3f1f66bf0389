//! Capability Registry Module
//!
//! Tracks, per backend, the advertised capacity and capabilities. Updated by
//! periodic backend reports; read by the scheduler as an immutable snapshot.

pub mod capability_registry;
pub mod events;

pub use capability_registry::*;
pub use events::*;
