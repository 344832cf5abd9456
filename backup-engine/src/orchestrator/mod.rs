//! Backup and restore workflows.
//!
//! Both fan a request out to one task per collection, bounded by a
//! semaphore, and fold the per-collection results into a single record. A
//! failing collection never stops its siblings.

pub mod backup;
pub mod restore;

use crate::models::ClusterRef;
use crate::ports::{
    BlobStore, ClusterControlPlane, ClusterEndpoint, Credential, CredentialResolver, RecordStore,
    SnapshotProvider,
};
use crate::transfer::RetryPolicy;
use crate::utils::errors::Result;
use futures_util::future::join_all;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

pub use backup::BackupOrchestrator;
pub use restore::RestoreOrchestrator;

/// The external systems an orchestrator works against.
#[derive(Clone)]
pub struct Collaborators {
    pub control: Arc<dyn ClusterControlPlane>,
    pub snapshots: Arc<dyn SnapshotProvider>,
    pub blobs: Arc<dyn BlobStore>,
    pub credentials: Arc<dyn CredentialResolver>,
    pub records: Arc<dyn RecordStore>,
}

/// Run `task` for every item with at most `limit` running at once (`0` means
/// no limit). Results come back in input order.
pub(crate) async fn fan_out<I, T, F, Fut>(items: Vec<I>, limit: usize, task: F) -> Vec<T>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = T>,
{
    let semaphore = (limit > 0).then(|| Semaphore::new(limit));
    let semaphore = semaphore.as_ref();
    let tasks = items.into_iter().map(|item| {
        let work = task(item);
        async move {
            let _permit = match semaphore {
                Some(semaphore) => semaphore.acquire().await.ok(),
                None => None,
            };
            work.await
        }
    });
    join_all(tasks).await
}

/// Endpoint of `cluster` plus its API key, if it has one.
pub(crate) async fn resolve_connection(
    control: &dyn ClusterControlPlane,
    credentials: &dyn CredentialResolver,
    retry: &RetryPolicy,
    cluster: &ClusterRef,
) -> Result<(ClusterEndpoint, Option<Credential>)> {
    let endpoint = retry
        .call("resolve endpoint", || control.resolve_endpoint(cluster))
        .await?;
    let credential = match &endpoint.api_key {
        Some(secret) => Some(
            retry
                .call("resolve credential", || credentials.resolve(secret))
                .await?,
        ),
        None => None,
    };
    Ok((endpoint, credential))
}

/// Drop repeated names, keeping first occurrences in order.
pub(crate) fn dedup(names: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names.into_iter().filter(|n| seen.insert(n.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_fan_out_respects_limit_and_order() {
        let (running, peak) = (AtomicUsize::new(0), AtomicUsize::new(0));
        let (running, peak) = (&running, &peak);

        let results = fan_out((0..10).collect(), 3, move |i: u32| {
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                i * 2
            }
        })
        .await;

        assert_eq!(results, (0..10).map(|i| i * 2).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_fan_out_zero_limit_is_unbounded() {
        let (running, peak) = (AtomicUsize::new(0), AtomicUsize::new(0));
        let (running, peak) = (&running, &peak);

        fan_out((0..6).collect::<Vec<u32>>(), 0, move |_| {
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;

        assert_eq!(peak.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        let names = vec!["b".to_string(), "a".into(), "b".into(), "c".into(), "a".into()];
        assert_eq!(dedup(names), vec!["b", "a", "c"]);
    }
}
