//! Cluster abstraction layer
//!
//! The operation set kdrain needs from a Kubernetes API server, plus an
//! in-memory implementation for tests.

mod interface;
mod mock;

pub use interface::*;
pub use mock::MockCluster;
