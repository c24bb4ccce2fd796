//! kdrain Core Library
//!
//! Cluster client abstraction for node draining.
//! This crate provides the client trait, eviction discovery, the pod removal
//! waiter and drain metrics.

pub mod cluster;
pub mod eviction;
pub mod metrics;
pub mod wait;

// Re-export common types
pub use cluster::{ClusterClient, ClusterError, MockCluster, PodRef, PollSettings};
pub use eviction::probe_eviction;
pub use metrics::MetricsRegistry;
pub use wait::{wait_for_delete, WaitError};
