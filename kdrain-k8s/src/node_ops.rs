//! Node Operations
//!
//! Implements node drain actions: Cordon, Pod Eviction/Deletion, Node Removal

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::{Node, Pod};
use thiserror::Error;
use tracing::{debug, info, warn};

use kdrain_core::cluster::{ClusterClient, ClusterError, PodRef};
use kdrain_core::metrics::MetricsRegistry;
use kdrain_core::wait::WaitError;

/// Annotation set by the kubelet on mirror pods of static pods
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Drain configuration
#[derive(Debug, Clone)]
pub struct DrainConfig {
    /// Leave pods owned by a DaemonSet in place
    pub ignore_daemon_sets: bool,
    /// Delete pods even when the server supports eviction
    pub disable_eviction: bool,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            ignore_daemon_sets: true,
            disable_eviction: false,
        }
    }
}

/// Errors that can occur while draining a node
#[derive(Debug, Error)]
pub enum DrainError {
    /// A cluster call failed
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Pods did not go away
    #[error(transparent)]
    Wait(#[from] WaitError),
}

/// Outcome of a drain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Whether pods were removed through the eviction subresource
    pub using_eviction: bool,
    /// Pods that were removed (or would be, in dry-run mode)
    pub removed: Vec<PodRef>,
    /// Pods left on the node
    pub skipped: Vec<PodRef>,
}

/// Node operator for drain actions
pub struct DrainOperator {
    client: Arc<dyn ClusterClient>,
    config: DrainConfig,
    metrics: Arc<MetricsRegistry>,
    dry_run: bool,
}

impl DrainOperator {
    /// Create a new drain operator
    pub fn new(
        client: Arc<dyn ClusterClient>,
        config: DrainConfig,
        metrics: Arc<MetricsRegistry>,
        dry_run: bool,
    ) -> Self {
        Self {
            client,
            config,
            metrics,
            dry_run,
        }
    }

    /// Cordon the node (mark as unschedulable)
    pub async fn cordon(&self, node_name: &str) -> Result<(), ClusterError> {
        self.set_unschedulable(node_name, true).await?;
        Ok(())
    }

    /// Uncordon the node (mark as schedulable)
    pub async fn uncordon(&self, node_name: &str) -> Result<(), ClusterError> {
        self.set_unschedulable(node_name, false).await?;
        Ok(())
    }

    /// Set `spec.unschedulable` and return the node as last seen
    async fn set_unschedulable(
        &self,
        node_name: &str,
        unschedulable: bool,
    ) -> Result<Node, ClusterError> {
        let action = if unschedulable { "cordon" } else { "uncordon" };
        let mut node = self.client.get_node(node_name).await?;

        let current = node
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false);
        if current == unschedulable {
            debug!(node = node_name, action = action, "Node already in desired state");
            return Ok(node);
        }

        if self.dry_run {
            info!(node = node_name, "[DRY-RUN] Would {} node", action);
            return Ok(node);
        }

        node.spec.get_or_insert_with(Default::default).unschedulable = Some(unschedulable);
        let node = self.client.update_node(&node).await?;
        self.metrics.inc_node_action(action);

        info!(node = node_name, action = action, "Node updated");
        Ok(node)
    }

    /// Delete the node object from the cluster
    pub async fn delete_node(&self, node_name: &str) -> Result<(), ClusterError> {
        if self.dry_run {
            info!(node = node_name, "[DRY-RUN] Would delete node");
            return Ok(());
        }

        self.client.delete_node(node_name).await?;
        self.metrics.inc_node_action("delete");

        info!(node = node_name, "Node deleted");
        Ok(())
    }

    /// Cordon the node, remove its pods and wait for them to be gone
    pub async fn drain(&self, node_name: &str) -> Result<DrainReport, DrainError> {
        let node = self.set_unschedulable(node_name, true).await?;
        let pods = self.client.list_pods(&node).await?;

        let (targets, skipped): (Vec<Pod>, Vec<Pod>) =
            pods.into_iter().partition(|p| !self.should_skip_pod(p));
        let skipped: Vec<PodRef> = skipped.iter().map(PodRef::from).collect();

        let policy_group_version = if self.config.disable_eviction {
            None
        } else {
            self.client.supports_eviction().await?
        };
        let using_eviction = policy_group_version.is_some();

        info!(
            node = node_name,
            pods = targets.len(),
            skipped = skipped.len(),
            eviction = using_eviction,
            "Draining node"
        );

        if self.dry_run {
            for pod in &targets {
                let pod_ref = PodRef::from(pod);
                info!(
                    namespace = %pod_ref.namespace,
                    pod = %pod_ref.name,
                    "[DRY-RUN] Would remove pod"
                );
            }
            return Ok(DrainReport {
                using_eviction,
                removed: targets.iter().map(PodRef::from).collect(),
                skipped,
            });
        }

        let mut removed = Vec::with_capacity(targets.len());
        for pod in &targets {
            let pod_ref = PodRef::from(pod);
            let result = match policy_group_version.as_deref() {
                Some(version) => self.client.evict_pod(pod, version).await,
                None => self.client.delete_pod(pod).await,
            };

            match result {
                Ok(()) => removed.push(pod_ref),
                Err(e) if e.is_not_found() => {
                    debug!(
                        namespace = %pod_ref.namespace,
                        pod = %pod_ref.name,
                        "Pod already gone"
                    );
                }
                Err(e) => {
                    warn!(
                        namespace = %pod_ref.namespace,
                        pod = %pod_ref.name,
                        error = %e,
                        "Failed to remove pod"
                    );
                    self.metrics.inc_removal_failure(using_eviction);
                    return Err(e.into());
                }
            }
        }

        let start = Instant::now();
        let waited = self.client.wait_for_delete(&removed, using_eviction).await;
        self.metrics
            .observe_wait_duration(using_eviction, start.elapsed().as_secs_f64());

        if let Err(e) = waited {
            if e.is_timeout() {
                self.metrics
                    .inc_pending_at_timeout(using_eviction, e.pending().len() as u64);
            }
            return Err(e.into());
        }

        self.metrics
            .inc_pods_removed(using_eviction, removed.len() as u64);
        self.metrics.inc_node_action("drain");

        info!(node = node_name, removed = removed.len(), "Node drained");
        Ok(DrainReport {
            using_eviction,
            removed,
            skipped,
        })
    }

    /// Check if a pod should be left alone during drain
    fn should_skip_pod(&self, pod: &Pod) -> bool {
        let metadata = &pod.metadata;

        // Mirror pods can only be removed through the kubelet
        if let Some(annotations) = &metadata.annotations {
            if annotations.contains_key(MIRROR_POD_ANNOTATION) {
                return true;
            }
        }

        if self.config.ignore_daemon_sets {
            if let Some(owner_refs) = &metadata.owner_references {
                if owner_refs.iter().any(|o| o.kind == "DaemonSet") {
                    return true;
                }
            }
        }

        // Finished pods hold no workload
        matches!(
            pod.status.as_ref().and_then(|s| s.phase.as_deref()),
            Some("Succeeded") | Some("Failed")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use kdrain_core::cluster::{MockCluster, PollSettings};

    fn fast_cluster() -> Arc<MockCluster> {
        Arc::new(MockCluster::with_poll_settings(PollSettings::new(
            Duration::from_millis(10),
            Duration::from_millis(200),
        )))
    }

    fn operator(cluster: Arc<MockCluster>, config: DrainConfig, dry_run: bool) -> DrainOperator {
        DrainOperator::new(cluster, config, Arc::new(MetricsRegistry::new()), dry_run)
    }

    fn daemon_set_pod(namespace: &str, name: &str, node: &str) -> Pod {
        let mut pod = plain_pod(namespace, name, node);
        pod.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "DaemonSet".to_string(),
            name: "agent".to_string(),
            uid: "ds-uid".to_string(),
            ..Default::default()
        }]);
        pod
    }

    fn plain_pod(namespace: &str, name: &str, node: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                uid: Some(format!("{}-uid", name)),
                ..Default::default()
            },
            spec: Some(k8s_openapi::api::core::v1::PodSpec {
                node_name: Some(node.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn setup_node(cluster: &MockCluster) {
        cluster.add_node("node-1").await;
        cluster.add_pod("default", "web-0", "web-0-uid", "node-1").await;
        cluster.add_pod("default", "web-1", "web-1-uid", "node-1").await;
        cluster.add_pod("default", "other", "other-uid", "node-2").await;
        cluster
            .insert_pod(daemon_set_pod("kube-system", "agent-x", "node-1"))
            .await;

        let mut mirror = plain_pod("kube-system", "etcd-node-1", "node-1");
        mirror.metadata.annotations = Some(BTreeMap::from([(
            MIRROR_POD_ANNOTATION.to_string(),
            "hash".to_string(),
        )]));
        cluster.insert_pod(mirror).await;

        let mut finished = plain_pod("default", "job-1", "node-1");
        finished.status = Some(PodStatus {
            phase: Some("Succeeded".to_string()),
            ..Default::default()
        });
        cluster.insert_pod(finished).await;
    }

    #[tokio::test]
    async fn test_cordon_and_uncordon() {
        let cluster = fast_cluster();
        cluster.add_node("node-1").await;
        let op = operator(cluster.clone(), DrainConfig::default(), false);

        op.cordon("node-1").await.unwrap();
        let node = cluster.get_node("node-1").await.unwrap();
        assert_eq!(node.spec.unwrap().unschedulable, Some(true));

        op.uncordon("node-1").await.unwrap();
        let node = cluster.get_node("node-1").await.unwrap();
        assert_eq!(node.spec.unwrap().unschedulable, Some(false));
    }

    #[tokio::test]
    async fn test_cordon_missing_node() {
        let cluster = fast_cluster();
        let op = operator(cluster, DrainConfig::default(), false);

        assert!(op.cordon("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_drain_evicts_when_supported() {
        let cluster = fast_cluster();
        cluster.add_api_group("policy", "policy/v1beta1").await;
        cluster.add_eviction_resource().await;
        setup_node(&cluster).await;
        let op = operator(cluster.clone(), DrainConfig::default(), false);

        let report = op.drain("node-1").await.unwrap();

        assert!(report.using_eviction);
        assert_eq!(
            report.removed,
            vec![
                PodRef::new("default", "web-0", "web-0-uid"),
                PodRef::new("default", "web-1", "web-1-uid"),
            ]
        );
        assert_eq!(report.skipped.len(), 3);
        let evictions = cluster.evictions().await;
        assert_eq!(evictions.len(), 2);
        assert!(evictions.iter().all(|(_, v)| v == "policy/v1beta1"));
        assert!(cluster.deletions().await.is_empty());
        assert!(cluster.has_pod("default", "other").await);
        assert!(cluster.has_pod("kube-system", "agent-x").await);
    }

    #[tokio::test]
    async fn test_drain_deletes_without_eviction_support() {
        let cluster = fast_cluster();
        setup_node(&cluster).await;
        let op = operator(cluster.clone(), DrainConfig::default(), false);

        let report = op.drain("node-1").await.unwrap();

        assert!(!report.using_eviction);
        assert_eq!(cluster.get_node_calls(), 1);
        assert_eq!(cluster.deletions().await.len(), 2);
        assert!(cluster.evictions().await.is_empty());
    }

    #[tokio::test]
    async fn test_drain_disable_eviction() {
        let cluster = fast_cluster();
        cluster.add_api_group("policy", "policy/v1").await;
        cluster.add_eviction_resource().await;
        setup_node(&cluster).await;
        let config = DrainConfig {
            disable_eviction: true,
            ..Default::default()
        };
        let op = operator(cluster.clone(), config, false);

        let report = op.drain("node-1").await.unwrap();

        assert!(!report.using_eviction);
        assert!(cluster.evictions().await.is_empty());
    }

    #[tokio::test]
    async fn test_drain_includes_daemon_set_pods_when_not_ignored() {
        let cluster = fast_cluster();
        setup_node(&cluster).await;
        let config = DrainConfig {
            ignore_daemon_sets: false,
            ..Default::default()
        };
        let op = operator(cluster.clone(), config, false);

        let report = op.drain("node-1").await.unwrap();

        assert_eq!(report.removed.len(), 3);
        assert!(!cluster.has_pod("kube-system", "agent-x").await);
    }

    #[tokio::test]
    async fn test_drain_times_out() {
        let cluster = fast_cluster();
        cluster.set_removal_delay(1000).await;
        setup_node(&cluster).await;
        let op = operator(cluster.clone(), DrainConfig::default(), false);

        let err = op.drain("node-1").await.unwrap_err();

        match err {
            DrainError::Wait(wait) => {
                assert!(wait.is_timeout());
                assert_eq!(wait.pending().len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_drain_dry_run() {
        let cluster = fast_cluster();
        setup_node(&cluster).await;
        let op = operator(cluster.clone(), DrainConfig::default(), true);

        let report = op.drain("node-1").await.unwrap();

        assert_eq!(report.removed.len(), 2);
        assert!(cluster.deletions().await.is_empty());
        assert!(cluster.has_pod("default", "web-0").await);
        let node = cluster.get_node("node-1").await.unwrap();
        assert_ne!(node.spec.and_then(|s| s.unschedulable), Some(true));
    }

    #[tokio::test]
    async fn test_delete_node() {
        let cluster = fast_cluster();
        cluster.add_node("node-1").await;
        let op = operator(cluster.clone(), DrainConfig::default(), false);

        op.delete_node("node-1").await.unwrap();
        assert!(!cluster.has_node("node-1").await);
    }
}
