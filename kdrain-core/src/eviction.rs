//! Eviction capability discovery
//!
//! Decides from the server's discovery documents whether pods can be evicted
//! through the `pods/eviction` subresource, and which policy group version
//! the Eviction body must carry.

use tracing::debug;

use crate::cluster::{ClusterClient, ClusterError};

/// Kind of the eviction subresource
pub const EVICTION_KIND: &str = "Eviction";

/// Name under which the eviction subresource is advertised
pub const EVICTION_SUBRESOURCE: &str = "pods/eviction";

/// API group that hosts the Eviction type
pub const POLICY_GROUP: &str = "policy";

/// Group version searched for the eviction subresource.
/// Always the core v1 listing, whatever version the policy group prefers.
const EVICTION_RESOURCE_GROUP_VERSION: &str = "v1";

/// Query the server for eviction support
///
/// Returns the preferred version of the `policy` group when the server
/// advertises both that group and the `pods/eviction` subresource, `None`
/// otherwise. Discovery errors are returned unchanged. Nothing is cached.
pub async fn probe_eviction<C>(client: &C) -> Result<Option<String>, ClusterError>
where
    C: ClusterClient + ?Sized,
{
    let groups = client.server_groups().await?;

    let Some(policy) = groups.groups.iter().find(|g| g.name == POLICY_GROUP) else {
        debug!("Server does not advertise the policy API group");
        return Ok(None);
    };

    let policy_group_version = policy
        .preferred_version
        .as_ref()
        .map(|v| v.group_version.clone())
        .unwrap_or_default();

    let resources = client
        .server_resources_for_group_version(EVICTION_RESOURCE_GROUP_VERSION)
        .await?;

    let has_eviction = resources
        .resources
        .iter()
        .any(|r| r.name == EVICTION_SUBRESOURCE && r.kind == EVICTION_KIND);

    if !has_eviction || policy_group_version.is_empty() {
        debug!("Eviction subresource not available");
        return Ok(None);
    }

    debug!(version = %policy_group_version, "Eviction supported");
    Ok(Some(policy_group_version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockCluster;

    #[tokio::test]
    async fn test_no_policy_group() {
        let cluster = MockCluster::new();
        cluster.add_api_group("apps", "apps/v1").await;
        cluster.add_eviction_resource().await;

        assert_eq!(probe_eviction(&cluster).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_policy_group_without_eviction_resource() {
        let cluster = MockCluster::new();
        cluster.add_api_group("policy", "policy/v1beta1").await;
        cluster.add_api_resource("v1", "pods", "Pod").await;

        assert_eq!(probe_eviction(&cluster).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_eviction_resource_name_and_kind_must_both_match() {
        let cluster = MockCluster::new();
        cluster.add_api_group("policy", "policy/v1").await;
        cluster.add_api_resource("v1", "pods/eviction", "Pod").await;
        cluster.add_api_resource("v1", "pods/status", "Eviction").await;

        assert_eq!(probe_eviction(&cluster).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_returns_preferred_version() {
        let cluster = MockCluster::new();
        cluster.add_api_group("policy", "policy/v1beta1").await;
        cluster.add_eviction_resource().await;

        assert_eq!(
            probe_eviction(&cluster).await.unwrap().as_deref(),
            Some("policy/v1beta1")
        );
    }

    #[tokio::test]
    async fn test_resource_looked_up_in_core_v1_only() {
        let cluster = MockCluster::new();
        cluster.add_api_group("policy", "policy/v1").await;
        cluster.add_api_resource("v1", "pods", "Pod").await;
        cluster
            .add_api_resource("policy/v1", EVICTION_SUBRESOURCE, EVICTION_KIND)
            .await;

        assert_eq!(probe_eviction(&cluster).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_core_listing_is_an_error() {
        let cluster = MockCluster::new();
        cluster.add_api_group("policy", "policy/v1").await;

        let err = probe_eviction(&cluster).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_policy_group_without_preferred_version() {
        let cluster = MockCluster::new();
        cluster.add_api_group_without_preference("policy").await;
        cluster.add_eviction_resource().await;

        assert_eq!(probe_eviction(&cluster).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_discovery_error_propagated() {
        let cluster = MockCluster::new();
        cluster.add_api_group("policy", "policy/v1").await;
        cluster.fail_discovery(503, "ServiceUnavailable").await;

        let err = probe_eviction(&cluster).await.unwrap_err();
        assert!(matches!(
            err,
            ClusterError::Kube(kube::Error::Api(ref ae)) if ae.code == 503
        ));
    }

    #[tokio::test]
    async fn test_trait_method_uses_probe() {
        let cluster = MockCluster::new();
        cluster.add_api_group("policy", "policy/v1").await;
        cluster.add_eviction_resource().await;

        assert_eq!(
            cluster.supports_eviction().await.unwrap().as_deref(),
            Some("policy/v1")
        );
    }
}
