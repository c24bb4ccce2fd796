//! In-memory cluster for testing

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Node, Pod, PodSpec, ServiceAccount};
use k8s_openapi::api::rbac::v1::ClusterRole;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    APIGroup, APIGroupList, APIResource, APIResourceList, GroupVersionForDiscovery, ObjectMeta,
};
use kube::api::ListParams;
use kube::core::ErrorResponse;
use tokio::sync::RwLock;

use super::{ClusterClient, ClusterError, PodRef, PollSettings};
use crate::eviction::{EVICTION_KIND, EVICTION_SUBRESOURCE};

type ObjectKey = (String, String);

fn key(namespace: &str, name: &str) -> ObjectKey {
    (namespace.to_string(), name.to_string())
}

fn api_error(code: u16, reason: &str, message: String) -> ClusterError {
    ClusterError::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn not_found(resource: &str, name: &str) -> ClusterError {
    api_error(
        404,
        "NotFound",
        format!("{} \"{}\" not found", resource, name),
    )
}

fn object_key(meta: &ObjectMeta) -> ObjectKey {
    key(
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default(),
    )
}

#[derive(Default)]
struct MockState {
    nodes: BTreeMap<String, Node>,
    pods: BTreeMap<ObjectKey, Pod>,
    service_accounts: BTreeMap<ObjectKey, ServiceAccount>,
    daemon_sets: BTreeMap<ObjectKey, DaemonSet>,
    deployments: BTreeMap<ObjectKey, Deployment>,
    cluster_roles: BTreeMap<String, ClusterRole>,
    api_groups: Vec<APIGroup>,
    api_resources: BTreeMap<String, Vec<APIResource>>,
    discovery_failure: Option<(u16, String)>,
    pod_failures: BTreeMap<ObjectKey, (u16, String)>,
    /// Lookups a removed pod still answers before it disappears
    removal_delay: u32,
    lingering: BTreeMap<ObjectKey, u32>,
    evictions: Vec<(PodRef, String)>,
    deletions: Vec<PodRef>,
}

impl MockState {
    fn remove_pod(&mut self, pod_key: ObjectKey) -> bool {
        if !self.pods.contains_key(&pod_key) {
            return false;
        }
        if self.removal_delay == 0 {
            self.pods.remove(&pod_key);
        } else {
            self.lingering.insert(pod_key, self.removal_delay);
        }
        true
    }
}

/// In-memory cluster implementing [`ClusterClient`]
///
/// Objects live in ordered maps. Pod lookups can be made to fail, and removed
/// pods can be kept visible for a number of lookups to exercise waiting.
pub struct MockCluster {
    settings: PollSettings,
    state: RwLock<MockState>,
    get_pod_calls: AtomicU32,
    get_node_calls: AtomicU32,
}

impl MockCluster {
    /// Create an empty mock cluster with default poll settings
    pub fn new() -> Self {
        Self::with_poll_settings(PollSettings::default())
    }

    /// Create an empty mock cluster with the given poll settings
    pub fn with_poll_settings(settings: PollSettings) -> Self {
        Self {
            settings,
            state: RwLock::new(MockState::default()),
            get_pod_calls: AtomicU32::new(0),
            get_node_calls: AtomicU32::new(0),
        }
    }

    /// Add a node
    pub async fn add_node(&self, name: &str) -> Node {
        let node = Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                uid: Some(format!("node-uid-{}", name)),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut state = self.state.write().await;
        state.nodes.insert(name.to_string(), node.clone());
        node
    }

    /// Add a pod scheduled on `node_name`
    pub async fn add_pod(&self, namespace: &str, name: &str, uid: &str, node_name: &str) -> Pod {
        let pod = Pod {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node_name.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.insert_pod(pod.clone()).await;
        pod
    }

    /// Insert a fully built pod, replacing any pod with the same name
    pub async fn insert_pod(&self, pod: Pod) {
        let mut state = self.state.write().await;
        let pod_key = object_key(&pod.metadata);
        state.lingering.remove(&pod_key);
        state.pods.insert(pod_key, pod);
    }

    /// Add a service account
    pub async fn add_service_account(&self, namespace: &str, name: &str) -> ServiceAccount {
        let sa = ServiceAccount {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut state = self.state.write().await;
        state
            .service_accounts
            .insert(key(namespace, name), sa.clone());
        sa
    }

    /// Add a daemonset
    pub async fn add_daemon_set(&self, namespace: &str, name: &str) -> DaemonSet {
        let ds = DaemonSet {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut state = self.state.write().await;
        state.daemon_sets.insert(key(namespace, name), ds.clone());
        ds
    }

    /// Add a deployment
    pub async fn add_deployment(&self, namespace: &str, name: &str) -> Deployment {
        let deployment = Deployment {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut state = self.state.write().await;
        state
            .deployments
            .insert(key(namespace, name), deployment.clone());
        deployment
    }

    /// Add a cluster role
    pub async fn add_cluster_role(&self, name: &str) -> ClusterRole {
        let role = ClusterRole {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut state = self.state.write().await;
        state.cluster_roles.insert(name.to_string(), role.clone());
        role
    }

    /// Advertise an API group with its preferred group version
    pub async fn add_api_group(&self, name: &str, preferred_group_version: &str) {
        let version = GroupVersionForDiscovery {
            group_version: preferred_group_version.to_string(),
            version: preferred_group_version
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string(),
        };
        let mut state = self.state.write().await;
        state.api_groups.push(APIGroup {
            name: name.to_string(),
            preferred_version: Some(version.clone()),
            versions: vec![version],
            ..Default::default()
        });
    }

    /// Advertise an API group that names no preferred version
    pub async fn add_api_group_without_preference(&self, name: &str) {
        let mut state = self.state.write().await;
        state.api_groups.push(APIGroup {
            name: name.to_string(),
            preferred_version: None,
            ..Default::default()
        });
    }

    /// Advertise a resource under a group version
    pub async fn add_api_resource(&self, group_version: &str, name: &str, kind: &str) {
        let mut state = self.state.write().await;
        state
            .api_resources
            .entry(group_version.to_string())
            .or_default()
            .push(APIResource {
                name: name.to_string(),
                kind: kind.to_string(),
                namespaced: true,
                ..Default::default()
            });
    }

    /// Advertise `pods/eviction` in the core v1 resource list
    pub async fn add_eviction_resource(&self) {
        self.add_api_resource("v1", EVICTION_SUBRESOURCE, EVICTION_KIND)
            .await;
    }

    /// Make every discovery call fail with the given status
    pub async fn fail_discovery(&self, code: u16, reason: &str) {
        let mut state = self.state.write().await;
        state.discovery_failure = Some((code, reason.to_string()));
    }

    /// Make lookups of one pod fail with the given status
    pub async fn fail_get_pod(&self, namespace: &str, name: &str, code: u16, reason: &str) {
        let mut state = self.state.write().await;
        state
            .pod_failures
            .insert(key(namespace, name), (code, reason.to_string()));
    }

    /// Keep removed pods visible for `lookups` further pod lookups
    pub async fn set_removal_delay(&self, lookups: u32) {
        let mut state = self.state.write().await;
        state.removal_delay = lookups;
    }

    /// Number of pod lookups served so far
    pub fn get_pod_calls(&self) -> u32 {
        self.get_pod_calls.load(Ordering::SeqCst)
    }

    /// Number of node lookups served so far
    pub fn get_node_calls(&self) -> u32 {
        self.get_node_calls.load(Ordering::SeqCst)
    }

    /// Evictions issued so far, with the version each was sent with
    pub async fn evictions(&self) -> Vec<(PodRef, String)> {
        self.state.read().await.evictions.clone()
    }

    /// Pods deleted so far
    pub async fn deletions(&self) -> Vec<PodRef> {
        self.state.read().await.deletions.clone()
    }

    /// Whether a pod is currently stored, lingering or not
    pub async fn has_pod(&self, namespace: &str, name: &str) -> bool {
        self.state
            .read()
            .await
            .pods
            .contains_key(&key(namespace, name))
    }

    /// Whether a node is currently registered
    pub async fn has_node(&self, name: &str) -> bool {
        self.state.read().await.nodes.contains_key(name)
    }

    fn discovery_error(state: &MockState) -> Option<ClusterError> {
        state
            .discovery_failure
            .as_ref()
            .map(|(code, reason)| api_error(*code, reason, "discovery failed".to_string()))
    }
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn list_pods(&self, node: &Node) -> Result<Vec<Pod>, ClusterError> {
        let node_name = node.metadata.name.as_deref().unwrap_or_default();
        let state = self.state.read().await;
        Ok(state
            .pods
            .values()
            .filter(|p| {
                p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node_name)
            })
            .cloned()
            .collect())
    }

    async fn list_all_pods(&self) -> Result<Vec<Pod>, ClusterError> {
        let state = self.state.read().await;
        Ok(state.pods.values().cloned().collect())
    }

    async fn list_nodes_with(&self, params: &ListParams) -> Result<Vec<Node>, ClusterError> {
        let state = self.state.read().await;
        let mut nodes: Vec<Node> = state.nodes.values().cloned().collect();
        if let Some(limit) = params.limit {
            nodes.truncate(limit as usize);
        }
        Ok(nodes)
    }

    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        self.get_node_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.read().await;
        state
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("nodes", name))
    }

    async fn update_node(&self, node: &Node) -> Result<Node, ClusterError> {
        let name = node.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.write().await;
        match state.nodes.get_mut(&name) {
            Some(stored) => {
                *stored = node.clone();
                Ok(node.clone())
            }
            None => Err(not_found("nodes", &name)),
        }
    }

    async fn delete_node(&self, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state.write().await;
        state
            .nodes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("nodes", name))
    }

    async fn list_service_accounts(
        &self,
        namespace: &str,
    ) -> Result<Vec<ServiceAccount>, ClusterError> {
        let state = self.state.read().await;
        Ok(state
            .service_accounts
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, sa)| sa.clone())
            .collect())
    }

    async fn delete_service_account(&self, sa: &ServiceAccount) -> Result<(), ClusterError> {
        let sa_key = object_key(&sa.metadata);
        let mut state = self.state.write().await;
        state
            .service_accounts
            .remove(&sa_key)
            .map(|_| ())
            .ok_or_else(|| not_found("serviceaccounts", &sa_key.1))
    }

    async fn delete_cluster_role(&self, role: &ClusterRole) -> Result<(), ClusterError> {
        let name = role.metadata.name.as_deref().unwrap_or_default();
        let mut state = self.state.write().await;
        state
            .cluster_roles
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("clusterroles.rbac.authorization.k8s.io", name))
    }

    async fn delete_daemon_set(&self, daemon_set: &DaemonSet) -> Result<(), ClusterError> {
        let ds_key = object_key(&daemon_set.metadata);
        let mut state = self.state.write().await;
        state
            .daemon_sets
            .remove(&ds_key)
            .map(|_| ())
            .ok_or_else(|| not_found("daemonsets.apps", &ds_key.1))
    }

    async fn delete_deployment(&self, deployment: &Deployment) -> Result<(), ClusterError> {
        let deploy_key = object_key(&deployment.metadata);
        let mut state = self.state.write().await;
        state
            .deployments
            .remove(&deploy_key)
            .map(|_| ())
            .ok_or_else(|| not_found("deployments.apps", &deploy_key.1))
    }

    async fn get_daemon_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DaemonSet, ClusterError> {
        let state = self.state.read().await;
        state
            .daemon_sets
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found("daemonsets.apps", name))
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Deployment, ClusterError> {
        let state = self.state.read().await;
        state
            .deployments
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found("deployments.apps", name))
    }

    async fn update_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ClusterError> {
        let name = deployment.metadata.name.as_deref().unwrap_or_default();
        let mut state = self.state.write().await;
        match state.deployments.get_mut(&key(namespace, name)) {
            Some(stored) => {
                *stored = deployment.clone();
                Ok(deployment.clone())
            }
            None => Err(not_found("deployments.apps", name)),
        }
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        self.get_pod_calls.fetch_add(1, Ordering::SeqCst);

        let pod_key = key(namespace, name);
        let mut state = self.state.write().await;

        if let Some((code, reason)) = state.pod_failures.get(&pod_key) {
            return Err(api_error(
                *code,
                reason,
                format!("failed to get pod {}/{}", namespace, name),
            ));
        }

        match state.lingering.get(&pod_key).copied() {
            Some(0) => {
                state.lingering.remove(&pod_key);
                state.pods.remove(&pod_key);
            }
            Some(left) => {
                state.lingering.insert(pod_key.clone(), left - 1);
            }
            None => {}
        }

        state
            .pods
            .get(&pod_key)
            .cloned()
            .ok_or_else(|| not_found("pods", name))
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<(), ClusterError> {
        let pod_key = object_key(&pod.metadata);
        let mut state = self.state.write().await;
        if !state.remove_pod(pod_key.clone()) {
            return Err(not_found("pods", &pod_key.1));
        }
        state.deletions.push(PodRef::from(pod));
        Ok(())
    }

    async fn evict_pod(&self, pod: &Pod, policy_group_version: &str) -> Result<(), ClusterError> {
        let pod_key = object_key(&pod.metadata);
        let mut state = self.state.write().await;
        if !state.remove_pod(pod_key.clone()) {
            return Err(not_found("pods", &pod_key.1));
        }
        state
            .evictions
            .push((PodRef::from(pod), policy_group_version.to_string()));
        Ok(())
    }

    async fn server_groups(&self) -> Result<APIGroupList, ClusterError> {
        let state = self.state.read().await;
        if let Some(err) = Self::discovery_error(&state) {
            return Err(err);
        }
        Ok(APIGroupList {
            groups: state.api_groups.clone(),
        })
    }

    async fn server_resources_for_group_version(
        &self,
        group_version: &str,
    ) -> Result<APIResourceList, ClusterError> {
        let state = self.state.read().await;
        if let Some(err) = Self::discovery_error(&state) {
            return Err(err);
        }
        state
            .api_resources
            .get(group_version)
            .map(|resources| APIResourceList {
                group_version: group_version.to_string(),
                resources: resources.clone(),
            })
            .ok_or_else(|| not_found("group version", group_version))
    }

    fn poll_settings(&self) -> PollSettings {
        self.settings
    }
}
