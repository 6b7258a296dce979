//! Integration test infrastructure for the netdev device-activation engine.
//!
//! Provides:
//! - Connection profile fixtures for bonds and their slaves
//! - A [`TestNetwork`] bundling an in-memory kernel with a device manager
//! - Operation-log verification helpers for kernel write sequences

pub mod fixtures;
mod verification;

pub use fixtures::*;
pub use verification::*;
