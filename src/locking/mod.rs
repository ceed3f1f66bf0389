//! Locking Service Module
//!
//! Named, leased mutual exclusion with fencing tokens. Acquisition never
//! blocks: a held resource answers `Busy` and the caller backs off. Lease
//! records live in the state store under `locks/`, so every worker sharing
//! a store sees the same holder and token sequence. Lease expiry is the only
//! liveness mechanism, so a crashed holder needs no cleanup.

pub mod lease;

pub use lease::*;
