//! Resource Synthesizer
//!
//! Deterministic builders for everything an [`AutoMQ`] owns, plus the merge
//! functions [`crate::api::create_or_update`] uses to fold a desired object
//! into the live one. Per role and index the managed set is a PVC, a Service
//! and a single-replica Deployment, all named `automq-<role>-<index>`.
//!
//! Builders are pure: the same spec and topology always produce the same
//! objects, which is what keeps repeated reconciles from rewriting anything.

mod pvc;
mod script;
mod service;
mod workload;

pub use pvc::{build_pvc, merge_pvc, DATA_VOLUME_SIZE};
pub use script::{build_script_configmap, merge_configmap, script_hash, SCRIPT_KEY};
pub use service::{
    allocated_node_port, build_bootstrap_service, build_role_service, merge_service,
    BOOTSTRAP_SERVICE_NAME,
};
pub use workload::{build_deployment, merge_deployment, startup_args, WorkloadInput};

use crate::crd::{AutoMQ, AutoMQSpec, RoleSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::fmt;

pub const LABEL_OWNER_BY: &str = "app.kubernetes.io/owner-by";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_ROLE: &str = "app.kubernetes.io/role";
pub const LABEL_INDEX: &str = "app.kubernetes.io/index";

const OWNER_BY: &str = "automq";
const COMPONENT: &str = "automq-operator";

/// The two role groups of an AutoMQ cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Controller,
    Broker,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Controller, Role::Broker];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Controller => "controller",
            Role::Broker => "broker",
        }
    }

    /// Listener port, also the named container port
    pub fn port(&self) -> i32 {
        match self {
            Role::Controller => 9093,
            Role::Broker => 9092,
        }
    }

    /// Node id of the process at `index`. Broker ids start at 10 so they
    /// never collide with controller ids.
    pub fn node_id(&self, index: i32) -> i32 {
        match self {
            Role::Controller => index,
            Role::Broker => index + 10,
        }
    }

    /// The role group of `spec` this role reads.
    pub fn spec<'a>(&self, spec: &'a AutoMQSpec) -> &'a RoleSpec {
        match self {
            Role::Controller => &spec.controller,
            Role::Broker => &spec.broker,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `automq-<role>-<index>`
pub fn resource_name(role: Role, index: i32) -> String {
    format!("automq-{}-{}", role, index)
}

/// Labels shared by every object of one AutoMQ
pub fn instance_labels(instance: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_OWNER_BY.to_string(), OWNER_BY.to_string()),
        (LABEL_COMPONENT.to_string(), COMPONENT.to_string()),
        (LABEL_INSTANCE.to_string(), instance.to_string()),
    ])
}

pub fn role_labels(instance: &str, role: Role) -> BTreeMap<String, String> {
    let mut labels = instance_labels(instance);
    labels.insert(LABEL_ROLE.to_string(), role.to_string());
    labels
}

pub fn index_labels(instance: &str, role: Role, index: i32) -> BTreeMap<String, String> {
    let mut labels = role_labels(instance, role);
    labels.insert(LABEL_INDEX.to_string(), index.to_string());
    labels
}

/// Render labels as an equality selector, `k=v,k2=v2`.
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn owner_reference(automq: &AutoMQ) -> OwnerReference {
    OwnerReference {
        api_version: AutoMQ::api_version(&()).to_string(),
        kind: AutoMQ::kind(&()).to_string(),
        name: automq.name_any(),
        uid: automq.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Metadata for a child object of `automq`
fn child_meta(automq: &AutoMQ, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: automq.namespace(),
        labels: Some(labels),
        owner_references: Some(vec![owner_reference(automq)]),
        ..Default::default()
    }
}

/// Copy the operator-owned metadata of `desired` onto `live`.
fn merge_meta(live: &mut ObjectMeta, desired: &ObjectMeta) {
    live.labels = desired.labels.clone();
    live.owner_references = desired.owner_references.clone();
}
