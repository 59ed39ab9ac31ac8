//! Scale Manager
//!
//! Scale-up needs no action: the role sync only materializes indices below
//! the desired count. Scale-down deletes the managed set of every index in
//! `[desired, observed)`.

use crate::api::ClusterApi;
use crate::error::Result;
use crate::resources::{resource_name, Role};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use tracing::{info, warn};

/// Delete the Deployment, Service and PVC of one index.
///
/// All three deletes are attempted; the first failure is returned.
/// Objects that are already gone count as deleted.
pub async fn delete_index<A: ClusterApi>(
    api: &A,
    namespace: &str,
    role: Role,
    index: i32,
) -> Result<()> {
    let name = resource_name(role, index);
    let results = [
        api.delete::<Deployment>(namespace, &name).await,
        api.delete::<Service>(namespace, &name).await,
        api.delete::<PersistentVolumeClaim>(namespace, &name).await,
    ];
    for result in results {
        result?;
    }
    Ok(())
}

/// Remove the managed sets above `desired`. Best effort: failures are
/// logged and left for a later pass.
///
/// Returns the indices that were processed.
pub async fn scale_down<A: ClusterApi>(
    api: &A,
    namespace: &str,
    role: Role,
    desired: i32,
    observed: i32,
) -> Vec<i32> {
    if observed <= desired {
        return Vec::new();
    }

    let indices: Vec<i32> = (desired.max(0)..observed).collect();
    info!(
        namespace = %namespace,
        role = %role,
        desired,
        observed,
        "scaling down"
    );
    for &index in &indices {
        if let Err(e) = delete_index(api, namespace, role, index).await {
            warn!(
                namespace = %namespace,
                role = %role,
                index,
                error = %e,
                "failed to delete scaled-down resources"
            );
        }
    }
    indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::memory::InMemoryApi;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    async fn seed_role(api: &InMemoryApi, role: Role, count: i32) {
        for index in 0..count {
            let name = resource_name(role, index);
            api.create("ns", &Deployment { metadata: meta(&name), ..Default::default() })
                .await
                .unwrap();
            api.create("ns", &Service { metadata: meta(&name), ..Default::default() })
                .await
                .unwrap();
            api.create(
                "ns",
                &PersistentVolumeClaim { metadata: meta(&name), ..Default::default() },
            )
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_scale_down_five_to_two() {
        let api = InMemoryApi::new();
        seed_role(&api, Role::Broker, 5).await;

        let removed = scale_down(&api, "ns", Role::Broker, 2, 5).await;
        assert_eq!(removed, vec![2, 3, 4]);

        let expected = vec!["automq-broker-0".to_string(), "automq-broker-1".to_string()];
        assert_eq!(api.names::<Deployment>("ns"), expected);
        assert_eq!(api.names::<Service>("ns"), expected);
        assert_eq!(api.names::<PersistentVolumeClaim>("ns"), expected);
    }

    #[tokio::test]
    async fn test_no_action_when_not_shrinking() {
        let api = InMemoryApi::new();
        seed_role(&api, Role::Controller, 2).await;
        assert!(scale_down(&api, "ns", Role::Controller, 3, 2).await.is_empty());
        assert!(scale_down(&api, "ns", Role::Controller, 2, 2).await.is_empty());
        assert_eq!(api.names::<Deployment>("ns").len(), 2);
    }

    #[tokio::test]
    async fn test_failed_delete_does_not_stop_the_rest() {
        let api = InMemoryApi::new();
        seed_role(&api, Role::Broker, 3).await;
        api.fail_kind("Service", "forbidden");

        let removed = scale_down(&api, "ns", Role::Broker, 1, 3).await;
        assert_eq!(removed, vec![1, 2]);
        assert_eq!(api.names::<Deployment>("ns"), vec!["automq-broker-0".to_string()]);
        assert_eq!(api.names::<Service>("ns").len(), 3);

        let err = delete_index(&api, "ns", Role::Broker, 2).await.unwrap_err();
        assert!(err.to_string().contains("forbidden"));
    }

    #[tokio::test]
    async fn test_missing_objects_are_tolerated() {
        let api = InMemoryApi::new();
        seed_role(&api, Role::Controller, 1).await;
        let removed = scale_down(&api, "ns", Role::Controller, 0, 3).await;
        assert_eq!(removed, vec![0, 1, 2]);
        assert!(api.names::<Deployment>("ns").is_empty());
    }
}
