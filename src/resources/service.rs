use super::{child_meta, index_labels, merge_meta, resource_name, role_labels, Role};
use crate::crd::AutoMQ;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;

/// Cluster-wide broker entry point
pub const BOOTSTRAP_SERVICE_NAME: &str = "automq-broker-bootstrap";

fn role_port(role: Role, node_port: Option<i32>) -> ServicePort {
    ServicePort {
        name: Some(role.to_string()),
        port: role.port(),
        target_port: Some(IntOrString::String(role.to_string())),
        protocol: Some("TCP".to_string()),
        node_port,
        ..Default::default()
    }
}

fn service(
    automq: &AutoMQ,
    name: String,
    labels: BTreeMap<String, String>,
    type_: &str,
    port: ServicePort,
) -> Service {
    Service {
        metadata: child_meta(automq, name, labels.clone()),
        spec: Some(ServiceSpec {
            type_: Some(type_.to_string()),
            selector: Some(labels),
            ports: Some(vec![port]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Per-index Service. Controllers are cluster-internal, brokers are
/// reachable through a node port.
pub fn build_role_service(automq: &AutoMQ, role: Role, index: i32) -> Service {
    let type_ = match role {
        Role::Controller => "ClusterIP",
        Role::Broker => "NodePort",
    };
    service(
        automq,
        resource_name(role, index),
        index_labels(&automq.name_any(), role, index),
        type_,
        role_port(role, None),
    )
}

/// NodePort Service in front of every broker
pub fn build_bootstrap_service(automq: &AutoMQ) -> Service {
    service(
        automq,
        BOOTSTRAP_SERVICE_NAME.to_string(),
        role_labels(&automq.name_any(), Role::Broker),
        "NodePort",
        role_port(Role::Broker, automq.spec.node_port),
    )
}

/// Fold the desired Service into the live one.
///
/// The selector is only written when the live object has none. A desired
/// port without a node port keeps the one already allocated on the live
/// port of the same name.
pub fn merge_service(live: &mut Service, desired: &Service) {
    merge_meta(&mut live.metadata, &desired.metadata);
    let Some(desired_spec) = desired.spec.as_ref() else {
        return;
    };
    let spec = live.spec.get_or_insert_with(Default::default);

    let mut ports = desired_spec.ports.clone().unwrap_or_default();
    for port in ports.iter_mut().filter(|p| p.node_port.is_none()) {
        port.node_port = spec
            .ports
            .iter()
            .flatten()
            .find(|p| p.name == port.name)
            .and_then(|p| p.node_port);
    }
    spec.ports = Some(ports);
    spec.type_ = desired_spec.type_.clone();
    if spec.selector.is_none() {
        spec.selector = desired_spec.selector.clone();
    }
}

/// Node port the API server allocated for the first port, `0` until then.
pub fn allocated_node_port(service: &Service) -> i32 {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .and_then(|ports| ports.first())
        .and_then(|p| p.node_port)
        .unwrap_or(0)
}
