//! Test utilities for tradenet
//!
//! Fixtures, a wired store harness, in-memory transports and async helpers,
//! shared by unit tests, integration tests and benches.

pub mod async_helpers;
pub mod fixtures;
pub mod network;

pub use async_helpers::*;
pub use fixtures::*;
pub use network::{LoopbackNetwork, LoopbackTransport, RecordingTransport};
