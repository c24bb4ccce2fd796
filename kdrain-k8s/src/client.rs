//! Kubernetes Client wrapper
//!
//! Implements [`ClusterClient`] on top of a live API server connection.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Node, Pod, ServiceAccount};
use k8s_openapi::api::rbac::v1::ClusterRole;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{APIGroupList, APIResourceList};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{Request, Status};
use kube::{Client, Config, Resource};
use serde_json::{json, Value};
use tracing::{debug, info};

use kdrain_core::cluster::{ClusterClient, ClusterError, PollSettings};
use kdrain_core::eviction::EVICTION_KIND;

/// Kubernetes client hooked up to a live API server
pub struct KubeCluster {
    client: Client,
    settings: PollSettings,
}

impl KubeCluster {
    /// Wrap an existing kube client
    pub fn new(client: Client, settings: PollSettings) -> Self {
        Self { client, settings }
    }

    /// Create a client from the environment (kubeconfig or in-cluster config)
    pub async fn try_default(settings: PollSettings) -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;

        info!("Connected to Kubernetes API server");
        Ok(Self::new(client, settings))
    }

    /// Create a client from kubeconfig contents
    ///
    /// When `api_server_url` is set it replaces the server address of the
    /// kubeconfig's current cluster.
    pub async fn from_kubeconfig(
        api_server_url: Option<&str>,
        kubeconfig_yaml: &str,
        settings: PollSettings,
    ) -> Result<Self, ClusterError> {
        let kubeconfig = Kubeconfig::from_yaml(kubeconfig_yaml)?;
        let mut config =
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;

        if let Some(url) = api_server_url.filter(|u| !u.is_empty()) {
            match url.parse() {
                Ok(uri) => config.cluster_url = uri,
                Err(e) => {
                    return Err(ClusterError::InvalidServerUrl {
                        url: url.to_string(),
                        reason: format!("{}", e),
                    })
                }
            }
        }

        debug!(server = %config.cluster_url, "Loaded kubeconfig");
        let client = Client::try_from(config)?;
        Ok(Self::new(client, settings))
    }

    /// Get the underlying kube client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods_all(&self) -> Api<Pod> {
        Api::all(self.client.clone())
    }
}

/// Field selector matching pods bound to `node`
fn node_field_selector(node: &Node) -> String {
    format!(
        "spec.nodeName={}",
        node.metadata.name.as_deref().unwrap_or_default()
    )
}

/// Eviction body for `pod`, tagged with the discovered policy group version
fn eviction_body(pod: &Pod, policy_group_version: &str) -> Value {
    json!({
        "apiVersion": policy_group_version,
        "kind": EVICTION_KIND,
        "metadata": {
            "name": pod.metadata.name.as_deref().unwrap_or_default(),
            "namespace": pod.metadata.namespace.as_deref().unwrap_or_default(),
        },
    })
}

fn name_of<K: Resource>(obj: &K) -> &str {
    obj.meta().name.as_deref().unwrap_or_default()
}

fn namespace_of<K: Resource>(obj: &K) -> &str {
    obj.meta().namespace.as_deref().unwrap_or_default()
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn list_pods(&self, node: &Node) -> Result<Vec<Pod>, ClusterError> {
        let params = ListParams::default().fields(&node_field_selector(node));
        Ok(self.pods_all().list(&params).await?.items)
    }

    async fn list_all_pods(&self) -> Result<Vec<Pod>, ClusterError> {
        Ok(self.pods_all().list(&ListParams::default()).await?.items)
    }

    async fn list_nodes_with(&self, params: &ListParams) -> Result<Vec<Node>, ClusterError> {
        Ok(self.nodes().list(params).await?.items)
    }

    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        Ok(self.nodes().get(name).await?)
    }

    async fn update_node(&self, node: &Node) -> Result<Node, ClusterError> {
        Ok(self
            .nodes()
            .replace(name_of(node), &PostParams::default(), node)
            .await?)
    }

    async fn delete_node(&self, name: &str) -> Result<(), ClusterError> {
        self.nodes().delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn list_service_accounts(
        &self,
        namespace: &str,
    ) -> Result<Vec<ServiceAccount>, ClusterError> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn delete_service_account(&self, sa: &ServiceAccount) -> Result<(), ClusterError> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace_of(sa));
        api.delete(name_of(sa), &DeleteParams::default()).await?;
        Ok(())
    }

    async fn delete_cluster_role(&self, role: &ClusterRole) -> Result<(), ClusterError> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        api.delete(name_of(role), &DeleteParams::default()).await?;
        Ok(())
    }

    async fn delete_daemon_set(&self, daemon_set: &DaemonSet) -> Result<(), ClusterError> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace_of(daemon_set));
        api.delete(name_of(daemon_set), &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn delete_deployment(&self, deployment: &Deployment) -> Result<(), ClusterError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace_of(deployment));
        api.delete(name_of(deployment), &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn get_daemon_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DaemonSet, ClusterError> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Deployment, ClusterError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn update_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ClusterError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .replace(name_of(deployment), &PostParams::default(), deployment)
            .await?)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        Ok(self.pods(namespace).get(name).await?)
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<(), ClusterError> {
        self.pods(namespace_of(pod))
            .delete(name_of(pod), &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn evict_pod(&self, pod: &Pod, policy_group_version: &str) -> Result<(), ClusterError> {
        let body = serde_json::to_vec(&eviction_body(pod, policy_group_version))
            .map_err(kube::Error::SerdeError)?;

        let request = Request::new(Pod::url_path(&(), Some(namespace_of(pod))))
            .create_subresource("eviction", name_of(pod), &PostParams::default(), body)
            .map_err(kube::Error::BuildRequest)?;

        let _: Status = self.client.request(request).await?;
        Ok(())
    }

    async fn server_groups(&self) -> Result<APIGroupList, ClusterError> {
        Ok(self.client.list_api_groups().await?)
    }

    async fn server_resources_for_group_version(
        &self,
        group_version: &str,
    ) -> Result<APIResourceList, ClusterError> {
        // Group versions without a group ("v1") live under /api, the rest under /apis
        let resources = if group_version.contains('/') {
            self.client.list_api_group_resources(group_version).await?
        } else {
            self.client.list_core_api_resources(group_version).await?
        };
        Ok(resources)
    }

    fn poll_settings(&self) -> PollSettings {
        self.settings
    }
}
