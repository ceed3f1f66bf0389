//! Domain layer - Core value types and port definitions
//!
//! This module defines the core traits (ports) that adapters implement,
//! following hexagonal architecture principles.

pub mod clock;
pub mod events;
pub mod ids;
pub mod ports;

pub use clock::*;
pub use events::*;
pub use ids::generate_id;
pub use ports::*;
