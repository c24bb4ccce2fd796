//! Cluster client trait and common types
//!
//! Defines the set of Kubernetes operations the drain tooling relies on.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Node, Pod, ServiceAccount};
use k8s_openapi::api::rbac::v1::ClusterRole;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{APIGroupList, APIResourceList};
use kube::api::ListParams;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::eviction;
use crate::wait::{self, WaitError};

/// Reference to a pod targeted for deletion or eviction
///
/// Two references name the same pod when namespace and name match. The UID
/// tells the original instance apart from a same-named replacement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodRef {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// UID of the instance that was targeted
    pub uid: String,
}

impl PodRef {
    /// Create a new pod reference
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: uid.into(),
        }
    }

    /// Check whether `pod` is the same instance this reference was taken from
    pub fn is_same_instance(&self, pod: &Pod) -> bool {
        pod.metadata.uid.as_deref().unwrap_or_default() == self.uid
    }
}

impl From<&Pod> for PodRef {
    fn from(pod: &Pod) -> Self {
        Self {
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            name: pod.metadata.name.clone().unwrap_or_default(),
            uid: pod.metadata.uid.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Polling cadence used when waiting for pods to go away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSettings {
    /// Delay between two polling cycles
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub interval: Duration,

    /// Total time allowed before giving up
    #[serde(with = "humantime_serde", default = "default_poll_timeout")]
    pub timeout: Duration,
}

impl PollSettings {
    /// Create poll settings from an interval and a timeout
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
            timeout: default_poll_timeout(),
        }
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(300)
}

/// Errors returned by cluster operations
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Error reported by the API server or the client transport, unchanged
    #[error(transparent)]
    Kube(#[from] kube::Error),

    /// Kubeconfig could not be parsed or resolved
    #[error("Invalid kubeconfig: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    /// API server URL override could not be parsed
    #[error("Invalid API server URL {url}: {reason}")]
    InvalidServerUrl { url: String, reason: String },
}

impl ClusterError {
    /// Whether the API server reported that the object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }
}

/// Cluster client trait
///
/// Every required method maps to exactly one API server call and returns its
/// result unchanged: no retries, no caching. The eviction probe and the
/// removal waiter are provided on top of those calls.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List pods scheduled on `node`, across all namespaces
    async fn list_pods(&self, node: &Node) -> Result<Vec<Pod>, ClusterError>;

    /// List every pod in the cluster
    async fn list_all_pods(&self) -> Result<Vec<Pod>, ClusterError>;

    /// List nodes using caller supplied list parameters
    async fn list_nodes_with(&self, params: &ListParams) -> Result<Vec<Node>, ClusterError>;

    /// List all registered nodes
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        self.list_nodes_with(&ListParams::default()).await
    }

    /// Get a node by name
    async fn get_node(&self, name: &str) -> Result<Node, ClusterError>;

    /// Replace a node with the given object
    async fn update_node(&self, node: &Node) -> Result<Node, ClusterError>;

    /// Deregister a node
    async fn delete_node(&self, name: &str) -> Result<(), ClusterError>;

    /// List service accounts in a namespace
    async fn list_service_accounts(
        &self,
        namespace: &str,
    ) -> Result<Vec<ServiceAccount>, ClusterError>;

    /// Delete a service account
    async fn delete_service_account(&self, sa: &ServiceAccount) -> Result<(), ClusterError>;

    /// Delete a cluster role
    async fn delete_cluster_role(&self, role: &ClusterRole) -> Result<(), ClusterError>;

    /// Delete a daemonset
    async fn delete_daemon_set(&self, daemon_set: &DaemonSet) -> Result<(), ClusterError>;

    /// Delete a deployment
    async fn delete_deployment(&self, deployment: &Deployment) -> Result<(), ClusterError>;

    /// Get a daemonset in a namespace
    async fn get_daemon_set(&self, namespace: &str, name: &str)
        -> Result<DaemonSet, ClusterError>;

    /// Get a deployment in a namespace
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Deployment, ClusterError>;

    /// Replace a deployment in a namespace
    async fn update_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ClusterError>;

    /// Get a pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError>;

    /// Delete a pod
    async fn delete_pod(&self, pod: &Pod) -> Result<(), ClusterError>;

    /// Evict a pod through the eviction subresource
    ///
    /// `policy_group_version` is the API version written into the Eviction
    /// body, as returned by [`ClusterClient::supports_eviction`].
    async fn evict_pod(&self, pod: &Pod, policy_group_version: &str) -> Result<(), ClusterError>;

    /// API groups advertised by the server
    async fn server_groups(&self) -> Result<APIGroupList, ClusterError>;

    /// Resources advertised for a group version
    async fn server_resources_for_group_version(
        &self,
        group_version: &str,
    ) -> Result<APIResourceList, ClusterError>;

    /// Polling cadence for [`ClusterClient::wait_for_delete`]
    fn poll_settings(&self) -> PollSettings;

    /// Discover whether the server supports pod eviction
    ///
    /// Returns the policy group version to evict with, or `None` when
    /// eviction is not available.
    async fn supports_eviction(&self) -> Result<Option<String>, ClusterError> {
        eviction::probe_eviction(self).await
    }

    /// Wait until every pod in `pods` is gone or replaced
    async fn wait_for_delete(
        &self,
        pods: &[PodRef],
        using_eviction: bool,
    ) -> Result<(), WaitError> {
        wait::wait_for_delete(self, pods, self.poll_settings(), using_eviction).await
    }
}
