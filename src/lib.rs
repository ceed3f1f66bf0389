//! Volume Orchestrator - Block Storage Control Plane
//!
//! Places volumes onto storage backends by capability and capacity, and runs
//! every lifecycle operation as a persisted, compensating task flow so that a
//! crashed worker never leaves capacity or volume state behind.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                   REST API (axum)  /  Event Bus                        │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │                           Orchestrator                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────────────┐ │
//! │  │  Scheduler   │  │ Lock Service │  │      Task-Flow Engine        │ │
//! │  │ filter/weigh │  │ lease+fence  │  │  steps, compensation, resume │ │
//! │  └──────┬───────┘  └──────────────┘  └──────────────┬───────────────┘ │
//! │         │                                           │                 │
//! │  ┌──────┴──────────────┐              ┌─────────────┴──────────────┐  │
//! │  │ Capability Registry │              │  Volume State Machine      │  │
//! │  └─────────────────────┘              └────────────────────────────┘  │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │           State Store (CAS)          │      Volume Drivers (LVM, NFS)  │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`orchestrator`]: request intake, retries, resumption and events
//! - [`registry`]: latest capacity and capability report per backend
//! - [`scheduler`]: backend selection and the capacity reservation ledger
//! - [`locking`]: leased volume locks with fencing tokens
//! - [`taskflow`]: crash-safe step sequences with reverse compensation
//! - [`volume`]: volume and snapshot records and their transitions
//! - [`drivers`]: backend driver implementations
//! - [`store`]: versioned key-value state
//! - [`api`]: REST surface
//! - [`domain`]: core value types and ports
//! - [`error`]: error types and handling

pub mod api;
pub mod domain;
pub mod drivers;
pub mod error;
pub mod locking;
pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod taskflow;
pub mod volume;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig, RestRouter};

pub use domain::events::{OperationKind, RequestOutcome, VolumeEvent};
pub use domain::ports::{
    BackendId, BackendKind, CapabilityRequirements, CapabilitySet, CapacityReport, Connector,
    EventPublisher, StateStore, VolumeDriver,
};

pub use drivers::{BackendSpec, DriverFactory, DriverSet};

pub use error::{Error, ErrorAction, Result};

pub use locking::{LockConfig, LockHandle, LockRecord, LockService};
pub use metrics::OrchestratorMetrics;

pub use orchestrator::{
    EventBus, Orchestrator, OrchestratorConfig, OrchestratorStatus, RetryConfig, VolumeHandle,
    VolumeOperation, VolumeRequest,
};

pub use registry::{BackendDescriptor, BackendReport, CapabilityRegistry, RegistryConfig};
pub use scheduler::{Placement, Reservation, Scheduler, SchedulerConfig, SchedulingRequest};
pub use store::MemoryStore;
pub use taskflow::{FlowEngine, FlowEngineConfig, FlowRecord, FlowStatus};
pub use volume::{Snapshot, Volume, VolumeState, VolumeStateMachine};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
