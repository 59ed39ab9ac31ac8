//! Status Phase Calculator
//!
//! The phase is recomputed from scratch on every refresh:
//!
//! ```text
//! Pending ──any condition not True──▶ Error
//!    │
//!    └──all True──▶ InProcess ──running+ready pods match both roles──▶ Ready
//! ```
//!
//! Nothing is terminal; the next refresh can move the phase anywhere.

use crate::api::{retry_on_conflict, ClusterApi, RetryPolicy, Shutdown};
use crate::conditions::Conditions;
use crate::crd::{AutoMQ, AutoMQPhase, AutoMQSpec, AutoMQStatus};
use crate::error::Result;
use crate::resources::{role_labels, selector_string, Role};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::debug;

/// Phase for the given conditions and running-and-ready pod counts.
pub fn compute_phase(
    conditions: &Conditions,
    controllers_ready: i32,
    brokers_ready: i32,
    spec: &AutoMQSpec,
) -> AutoMQPhase {
    if !conditions.all_true() {
        return AutoMQPhase::Error;
    }
    if controllers_ready == spec.controller.replicas && brokers_ready == spec.broker.replicas {
        AutoMQPhase::Ready
    } else {
        AutoMQPhase::InProcess
    }
}

/// Running, and no Ready condition other than `True`.
pub fn is_pod_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .iter()
        .flatten()
        .filter(|c| c.type_ == "Ready")
        .all(|c| c.status == "True")
}

/// Running-and-ready pods of one role of `instance`.
pub async fn count_ready_pods<A: ClusterApi>(
    api: &A,
    namespace: &str,
    instance: &str,
    role: Role,
) -> Result<i32> {
    let selector = selector_string(&role_labels(instance, role));
    let pods: Vec<Pod> = api.list(namespace, &selector).await?;
    Ok(pods.iter().filter(|p| is_pod_ready(p)).count() as i32)
}

/// Recompute `status.phase` and `status.ready_pods` for `automq`.
pub async fn refresh_phase<A: ClusterApi>(
    api: &A,
    automq: &AutoMQ,
    status: &mut AutoMQStatus,
) -> Result<()> {
    let namespace = automq.namespace().unwrap_or_default();
    let instance = automq.name_any();
    let controllers = count_ready_pods(api, &namespace, &instance, Role::Controller).await?;
    let brokers = count_ready_pods(api, &namespace, &instance, Role::Broker).await?;

    status.ready_pods = controllers + brokers;
    status.phase = compute_phase(&status.conditions, controllers, brokers, &automq.spec);
    debug!(
        name = %instance,
        namespace = %namespace,
        phase = %status.phase,
        ready_pods = status.ready_pods,
        "phase computed"
    );
    Ok(())
}

/// Write `status` onto the live object's status subresource.
///
/// Every attempt re-reads the live object; nothing is written when its
/// status already matches. Returns whether a write happened.
pub async fn persist_status<A: ClusterApi>(
    api: &A,
    retry: &RetryPolicy,
    shutdown: &Shutdown,
    namespace: &str,
    name: &str,
    status: &AutoMQStatus,
) -> Result<bool> {
    retry_on_conflict(retry, shutdown, move || async move {
        let Some(mut live) = api.get::<AutoMQ>(namespace, name).await? else {
            return Ok(false);
        };
        if live.status.as_ref() == Some(status) {
            return Ok(false);
        }
        live.status = Some(status.clone());
        api.replace_status(namespace, &live).await?;
        Ok(true)
    })
    .await
}

/// Periodic refresh: recompute the phase of the live object and persist it.
///
/// Returns `false` once the object is gone.
pub async fn refresh<A: ClusterApi>(
    api: &A,
    retry: &RetryPolicy,
    shutdown: &Shutdown,
    namespace: &str,
    name: &str,
) -> Result<bool> {
    let Some(automq) = api.get::<AutoMQ>(namespace, name).await? else {
        return Ok(false);
    };
    let mut status = automq.status_or_default();
    refresh_phase(api, &automq, &mut status).await?;
    persist_status(api, retry, shutdown, namespace, name, &status).await?;
    Ok(true)
}
