//! Pod removal waiter
//!
//! Polls the API server until a set of deleted or evicted pods is gone.
//! A pod counts as gone when it is no longer found, or when a pod with the
//! same name but a different UID has taken its place.

use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::cluster::{ClusterClient, ClusterError, PodRef, PollSettings};

/// Errors that end a wait before every pod is gone
#[derive(Debug, Error)]
pub enum WaitError {
    /// Deadline passed with pods still present
    #[error("Timed out after {:?} waiting for {} pod(s) to be {}", .timeout, .pending.len(), .verb)]
    Timeout {
        timeout: Duration,
        verb: &'static str,
        pending: Vec<PodRef>,
    },

    /// A pod lookup failed with something other than not-found
    #[error("Pod lookup failed with {} pod(s) pending", .pending.len())]
    Poll {
        pending: Vec<PodRef>,
        #[source]
        source: ClusterError,
    },
}

impl WaitError {
    /// Pods that were still present when the wait ended
    pub fn pending(&self) -> &[PodRef] {
        match self {
            WaitError::Timeout { pending, .. } | WaitError::Poll { pending, .. } => pending,
        }
    }

    /// Take the pending pods out of the error
    pub fn into_pending(self) -> Vec<PodRef> {
        match self {
            WaitError::Timeout { pending, .. } | WaitError::Poll { pending, .. } => pending,
        }
    }

    /// Whether the wait ended because the deadline passed
    pub fn is_timeout(&self) -> bool {
        matches!(self, WaitError::Timeout { .. })
    }
}

fn removal_verb(using_eviction: bool) -> &'static str {
    if using_eviction {
        "evicted"
    } else {
        "deleted"
    }
}

/// Wait until every pod in `pods` has been removed
///
/// Polls once immediately, then every `settings.interval` until
/// `settings.timeout` has elapsed. `using_eviction` only changes log wording.
///
/// On timeout the error carries the pods still present, in input order. A
/// lookup error other than not-found stops the wait at once; the error then
/// carries the pods that were pending when the failing cycle started.
/// A timeout too large to be represented as a deadline never expires.
pub async fn wait_for_delete<C>(
    client: &C,
    pods: &[PodRef],
    settings: PollSettings,
    using_eviction: bool,
) -> Result<(), WaitError>
where
    C: ClusterClient + ?Sized,
{
    let verb = removal_verb(using_eviction);
    let deadline = Instant::now().checked_add(settings.timeout);
    let mut pending = pods.to_vec();

    loop {
        let remaining = match poll_pending(client, &pending, verb).await {
            Ok(remaining) => remaining,
            Err(source) => return Err(WaitError::Poll { pending, source }),
        };
        pending = remaining;

        if pending.is_empty() {
            return Ok(());
        }

        let now = Instant::now();
        let pause = match deadline {
            Some(deadline) if now >= deadline => None,
            Some(deadline) => Some(settings.interval.min(deadline - now)),
            None => Some(settings.interval),
        };
        let Some(pause) = pause else {
            warn!(
                pending = pending.len(),
                timeout = ?settings.timeout,
                "Pods not {} before timeout", verb
            );
            return Err(WaitError::Timeout {
                timeout: settings.timeout,
                verb,
                pending,
            });
        };

        debug!(pending = pending.len(), "Waiting for pods to be {}", verb);
        sleep(pause).await;
    }
}

/// Run one polling cycle and return the pods still present
async fn poll_pending<C>(
    client: &C,
    pods: &[PodRef],
    verb: &str,
) -> Result<Vec<PodRef>, ClusterError>
where
    C: ClusterClient + ?Sized,
{
    let mut still_pending = Vec::with_capacity(pods.len());

    for pod in pods {
        match client.get_pod(&pod.namespace, &pod.name).await {
            Ok(current) if pod.is_same_instance(&current) => still_pending.push(pod.clone()),
            Ok(_) => {
                info!(
                    namespace = %pod.namespace,
                    pod = %pod.name,
                    "Pod successfully {} (replaced)", verb
                );
            }
            Err(e) if e.is_not_found() => {
                info!(
                    namespace = %pod.namespace,
                    pod = %pod.name,
                    "Pod successfully {}", verb
                );
            }
            Err(e) => return Err(e),
        }
    }

    Ok(still_pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockCluster;

    fn settings(interval_ms: u64, timeout_ms: u64) -> PollSettings {
        PollSettings::new(
            Duration::from_millis(interval_ms),
            Duration::from_millis(timeout_ms),
        )
    }

    #[tokio::test]
    async fn test_empty_pod_list_succeeds() {
        let cluster = MockCluster::new();
        let start = std::time::Instant::now();

        wait_for_delete(&cluster, &[], settings(1000, 5000), false)
            .await
            .unwrap();

        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(cluster.get_pod_calls(), 0);
    }

    #[tokio::test]
    async fn test_not_found_on_first_poll() {
        let cluster = MockCluster::new();
        let pods = vec![PodRef::new("default", "a", "1")];
        let start = std::time::Instant::now();

        wait_for_delete(&cluster, &pods, settings(1000, 5000), true)
            .await
            .unwrap();

        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(cluster.get_pod_calls(), 1);
    }

    #[tokio::test]
    async fn test_pod_present_until_timeout() {
        let cluster = MockCluster::new();
        cluster.add_pod("default", "a", "1", "node-1").await;
        let pods = vec![PodRef::new("default", "a", "1")];

        let err = wait_for_delete(&cluster, &pods, settings(50, 200), false)
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(err.pending(), pods.as_slice());
        assert!(cluster.get_pod_calls() >= 4);
        assert!(err.to_string().contains("deleted"));
    }

    #[tokio::test]
    async fn test_timeout_excludes_removed_pods() {
        let cluster = MockCluster::new();
        cluster.add_pod("default", "a", "1", "node-1").await;
        cluster.add_pod("default", "c", "3", "node-1").await;
        let pods = vec![
            PodRef::new("default", "a", "1"),
            PodRef::new("default", "b", "2"),
            PodRef::new("default", "c", "3"),
        ];

        let err = wait_for_delete(&cluster, &pods, settings(20, 100), true)
            .await
            .unwrap_err();

        assert_eq!(
            err.into_pending(),
            vec![PodRef::new("default", "a", "1"), PodRef::new("default", "c", "3")]
        );
    }

    #[tokio::test]
    async fn test_uid_change_counts_as_removed() {
        let cluster = MockCluster::new();
        cluster.add_pod("default", "a", "2", "node-1").await;
        let pods = vec![PodRef::new("default", "a", "1")];

        wait_for_delete(&cluster, &pods, settings(50, 200), false)
            .await
            .unwrap();
        assert_eq!(cluster.get_pod_calls(), 1);
    }

    #[tokio::test]
    async fn test_pod_removed_after_a_few_polls() {
        let cluster = MockCluster::new();
        cluster.set_removal_delay(2).await;
        let pod = cluster.add_pod("default", "a", "1", "node-1").await;
        cluster.delete_pod(&pod).await.unwrap();

        let pods = vec![PodRef::from(&pod)];
        wait_for_delete(&cluster, &pods, settings(10, 2000), false)
            .await
            .unwrap();

        assert_eq!(cluster.get_pod_calls(), 3);
    }

    #[tokio::test]
    async fn test_unrepresentable_timeout_keeps_polling() {
        let cluster = MockCluster::new();
        cluster.set_removal_delay(2).await;
        let pod = cluster.add_pod("default", "a", "1", "node-1").await;
        cluster.delete_pod(&pod).await.unwrap();

        let huge = PollSettings::new(
            Duration::from_millis(10),
            Duration::from_secs(u64::MAX / 2),
        );
        wait_for_delete(&cluster, &[PodRef::from(&pod)], huge, false)
            .await
            .unwrap();

        assert_eq!(cluster.get_pod_calls(), 3);
    }

    #[tokio::test]
    async fn test_lookup_error_aborts_cycle() {
        let cluster = MockCluster::new();
        cluster.add_pod("default", "a", "1", "node-1").await;
        cluster.add_pod("default", "c", "3", "node-1").await;
        cluster.fail_get_pod("default", "b", 500, "InternalError").await;
        let pods = vec![
            PodRef::new("default", "a", "1"),
            PodRef::new("default", "b", "2"),
            PodRef::new("default", "c", "3"),
        ];

        let err = wait_for_delete(&cluster, &pods, settings(10, 5000), false)
            .await
            .unwrap_err();

        assert!(!err.is_timeout());
        assert_eq!(err.pending(), pods.as_slice());
        assert_eq!(err.to_string(), "Pod lookup failed with 3 pod(s) pending");
        // "c" is never looked up once "b" fails
        assert_eq!(cluster.get_pod_calls(), 2);
        match err {
            WaitError::Poll { source, .. } => assert!(!source.is_not_found()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_input_left_untouched() {
        let cluster = MockCluster::new();
        let pods = vec![PodRef::new("default", "a", "1")];
        let before = pods.clone();

        cluster.wait_for_delete(&pods, true).await.unwrap();
        assert_eq!(pods, before);
    }
}
