//! kdrain Kubernetes Integration
//!
//! Provides the kube-backed cluster client and node drain operations.

pub mod client;
pub mod node_ops;

pub use client::KubeCluster;
pub use node_ops::{DrainConfig, DrainError, DrainOperator, DrainReport};
