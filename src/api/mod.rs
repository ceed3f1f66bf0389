//! API Module
//!
//! REST surface for volume lifecycle requests, backend reports and status.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
