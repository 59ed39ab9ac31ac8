//! Orchestration API seam
//!
//! Every read and write the reconciler performs goes through [`ClusterApi`].
//! [`KubeApi`] talks to the API server; [`memory::InMemoryApi`] keeps objects
//! in process with the same resourceVersion semantics and backs the tests.
//!
//! Writes follow optimistic concurrency: a replace carries the
//! resourceVersion it read, a stale one fails with `Conflict`, and the caller
//! reruns the whole read-mutate-write through [`retry_on_conflict`].

mod kube_api;
pub mod memory;
mod retry;

pub use kube_api::KubeApi;
pub use retry::{retry_on_conflict, shutdown_channel, RetryPolicy, Shutdown, ShutdownTrigger};

use crate::error::Result;
use async_trait::async_trait;
use kube::core::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::debug;

/// Namespaced object kinds the operator reads and writes.
pub trait Managed:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> Managed for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Namespaced CRUD against the orchestration API.
#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    /// Fetch an object; `None` when it does not exist.
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// Create an object. Fails with `AlreadyExists` if the name is taken.
    async fn create<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Replace an object. Fails with `Conflict` on a stale resourceVersion.
    async fn replace<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Replace only the status subresource.
    async fn replace_status<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Delete an object. Returns `false` when it was already gone.
    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<bool>;

    /// List objects matching an equality label selector (`k=v,k2=v2`).
    async fn list<K: Managed>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>>;
}

/// Outcome of [`create_or_update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    Created,
    Updated,
    Unchanged,
}

/// Create `desired`, or fold its owned fields into the live object.
///
/// `merge` copies the fields this operator owns from `desired` onto the live
/// object and must leave everything else (resourceVersion, server defaults,
/// immutable selectors) alone. The live object is only written when the
/// merge changed it. Conflicts rerun the whole fetch-merge-write.
pub async fn create_or_update<A, K, F>(
    api: &A,
    retry: &RetryPolicy,
    shutdown: &Shutdown,
    desired: &K,
    merge: F,
) -> Result<OperationResult>
where
    A: ClusterApi,
    K: Managed + PartialEq,
    F: Fn(&mut K, &K) + Send + Sync,
{
    let merge = &merge;
    retry_on_conflict(retry, shutdown, move || {
        create_or_update_once(api, desired, merge)
    })
    .await
}

async fn create_or_update_once<A, K, F>(api: &A, desired: &K, merge: &F) -> Result<OperationResult>
where
    A: ClusterApi,
    K: Managed + PartialEq,
    F: Fn(&mut K, &K) + Send + Sync,
{
    let name = desired.name_any();
    let namespace = desired.namespace().unwrap_or_default();

    let result = match api.get::<K>(&namespace, &name).await? {
        None => {
            api.create(&namespace, desired).await?;
            OperationResult::Created
        }
        Some(live) => {
            let mut updated = live.clone();
            merge(&mut updated, desired);
            if updated == live {
                OperationResult::Unchanged
            } else {
                api.replace(&namespace, &updated).await?;
                OperationResult::Updated
            }
        }
    };

    debug!(
        kind = %K::kind(&()),
        name = %name,
        namespace = %namespace,
        result = ?result,
        "create or update"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::memory::InMemoryApi;
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn configmap(value: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("script".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("up.sh".to_string(), value.to_string())])),
            ..Default::default()
        }
    }

    fn merge_data(live: &mut ConfigMap, desired: &ConfigMap) {
        live.data = desired.data.clone();
    }

    #[tokio::test]
    async fn test_create_then_unchanged_then_updated() {
        let api = InMemoryApi::new();
        let retry = RetryPolicy::default();
        let shutdown = Shutdown::never();

        let first = create_or_update(&api, &retry, &shutdown, &configmap("a"), merge_data)
            .await
            .unwrap();
        assert_eq!(first, OperationResult::Created);

        let second = create_or_update(&api, &retry, &shutdown, &configmap("a"), merge_data)
            .await
            .unwrap();
        assert_eq!(second, OperationResult::Unchanged);

        let third = create_or_update(&api, &retry, &shutdown, &configmap("b"), merge_data)
            .await
            .unwrap();
        assert_eq!(third, OperationResult::Updated);

        let live: ConfigMap = api.get("ns", "script").await.unwrap().unwrap();
        assert_eq!(live.data.unwrap()["up.sh"], "b");
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let api = InMemoryApi::new();
        let retry = RetryPolicy::default();
        let shutdown = Shutdown::never();

        create_or_update(&api, &retry, &shutdown, &configmap("a"), merge_data)
            .await
            .unwrap();
        api.inject_conflicts(2);

        let result = create_or_update(&api, &retry, &shutdown, &configmap("b"), merge_data)
            .await
            .unwrap();
        assert_eq!(result, OperationResult::Updated);
    }

    #[tokio::test]
    async fn test_conflicts_exhaust_attempts() {
        let api = InMemoryApi::new();
        let retry = RetryPolicy::default();
        let shutdown = Shutdown::never();

        create_or_update(&api, &retry, &shutdown, &configmap("a"), merge_data)
            .await
            .unwrap();
        api.inject_conflicts(10);

        let err = create_or_update(&api, &retry, &shutdown, &configmap("b"), merge_data)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }
}
