//! Quorum addressing
//!
//! Controller voters and the bootstrap address are derived from the replica
//! count and the naming convention alone. Every controller and broker gets
//! the same voter list, so the order is fixed: ascending node id.

use crate::crd::AutoMQ;
use crate::resources::{resource_name, Role, BOOTSTRAP_SERVICE_NAME};
use kube::ResourceExt;

/// `<id>@automq-controller-<id>.<namespace>.svc:9093` for every controller.
pub fn controller_voters(replicas: i32, namespace: &str) -> Vec<String> {
    (0..replicas.max(0))
        .map(|index| {
            format!(
                "{}@{}.{}.svc:{}",
                Role::Controller.node_id(index),
                resource_name(Role::Controller, index),
                namespace,
                Role::Controller.port()
            )
        })
        .collect()
}

/// Voters of the quorum declared by `automq`.
pub fn voters_for(automq: &AutoMQ) -> Vec<String> {
    controller_voters(
        automq.spec.controller.replicas,
        &automq.namespace().unwrap_or_default(),
    )
}

/// In-cluster address of the bootstrap Service.
pub fn bootstrap_address(namespace: &str) -> String {
    format!(
        "{}.{}.svc:{}",
        BOOTSTRAP_SERVICE_NAME,
        namespace,
        Role::Broker.port()
    )
}
