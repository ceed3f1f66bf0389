//! Orchestrator Module
//!
//! Accepts volume lifecycle requests and drives each through scheduling,
//! locking and a persisted task flow to exactly one terminal event.

pub(crate) mod completion;
pub mod config;
pub mod events;
pub mod flows;
pub mod request;
pub mod service;

pub use config::{OrchestratorConfig, RetryConfig};
pub use events::EventBus;
pub use flows::VolumeFlows;
pub use request::{VolumeHandle, VolumeOperation, VolumeRequest};
pub use service::{Orchestrator, OrchestratorStatus};
