use super::{child_meta, index_labels, merge_meta, resource_name, role_labels, Role, SCRIPT_KEY};
use crate::config::OperatorConfig;
use crate::crd::AutoMQ;
use crate::quorum;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, ExecAction,
    HostPathVolumeSource, Lifecycle, LifecycleHandler, ObjectFieldSelector,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
    SecurityContext, TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;

const SCRIPT_VOLUME: &str = "script";
const SCRIPT_PATH: &str = "/opt/kafka/scripts/mq-start.sh";
const DATA_PATH: &str = "/data/kafka";
const TZ_VOLUME: &str = "k8tz";
const LOCALTIME: &str = "/etc/localtime";
const SCRIPT_HASH_ANNOTATION: &str = "configmap/script-hash";
const METRICS_PORT: &str = "9090";

const SYSCTLS: &[&str] = &[
    "sysctl -w fs.inotify.max_user_watches=8000000",
    "sysctl -w fs.file-max=40265318",
    "sysctl -w fs.inotify.max_user_instances=12800",
    "sysctl -w fs.inotify.max_queued_events=8000000",
    "sysctl -w net.core.somaxconn=65535",
    "sysctl -w net.ipv4.ip_local_port_range=\"1024 65535\"",
    "sysctl -w net.ipv4.tcp_tw_reuse=1",
    "sysctl -w net.ipv4.tcp_fin_timeout=10",
    "sysctl -w net.ipv4.tcp_keepalive_intvl=75",
    "sysctl -w net.ipv4.tcp_keepalive_probes=9",
    "sysctl -w net.ipv4.tcp_keepalive_time=7200",
    "ulimit -a",
    "mkdir -p /etc/security",
    "echo \"* - nofile 1048576\" >> /etc/security/limits.conf",
    "echo \"* - nproc 1048576\" >> /etc/security/limits.conf",
    "echo \"root - nofile 1048576\" >> /etc/security/limits.conf",
    "echo \"root - nproc 1048576\" >> /etc/security/limits.conf",
];

/// Everything a workload depends on besides the AutoMQ itself
#[derive(Debug, Clone, Copy)]
pub struct WorkloadInput<'a> {
    pub automq: &'a AutoMQ,
    pub role: Role,
    pub index: i32,
    /// Node port allocated to the broker's own Service; ignored for controllers
    pub node_port: i32,
    pub script_hash: &'a str,
    pub config: &'a OperatorConfig,
}

/// Arguments handed to the entrypoint script. Identical for identical
/// spec and topology.
pub fn startup_args(automq: &AutoMQ, role: Role, index: i32) -> Vec<String> {
    let s3 = &automq.spec.s3;
    vec![
        SCRIPT_PATH.to_string(),
        "up".to_string(),
        "--process.roles".to_string(),
        role.to_string(),
        "--node.id".to_string(),
        role.node_id(index).to_string(),
        "--cluster.id".to_string(),
        automq.spec.cluster_id.clone(),
        "--controller.quorum.voters".to_string(),
        quorum::voters_for(automq).join(","),
        "--s3.bucket".to_string(),
        s3.bucket.clone(),
        "--s3.endpoint".to_string(),
        s3.endpoint.clone(),
        "--s3.region".to_string(),
        s3.region.clone(),
        "--s3.path.style".to_string(),
        s3.enable_path_style.to_string(),
    ]
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: Some("v1".to_string()),
                field_path: field_path.to_string(),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn value_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn container_env(input: &WorkloadInput<'_>) -> Vec<EnvVar> {
    let spec = &input.automq.spec;
    let role_spec = input.role.spec(spec);

    let mut env = vec![
        field_env("NAMESPACE_NAME", "metadata.namespace"),
        field_env("POD_NAME", "metadata.name"),
    ];
    if input.role == Role::Broker {
        env.push(field_env("NODE_NAME", "spec.nodeName"));
    }
    env.extend([
        field_env("POD_IP", "status.podIP"),
        value_env("KAFKA_S3_ACCESS_KEY", spec.s3.access_key_id.clone()),
        value_env("KAFKA_S3_SECRET_KEY", spec.s3.secret_access_key.clone()),
        value_env("KAFKA_HEAP_OPTS", role_spec.jvm_options.join(" ")),
    ]);
    if input.role == Role::Broker {
        env.extend([
            value_env("KAFKA_CFG_AUTOBALANCER_REPORTER_NETWORK_IN_CAPACITY", "5120"),
            value_env("KAFKA_CFG_AUTOBALANCER_REPORTER_NETWORK_OUT_CAPACITY", "5120"),
            value_env(
                "KAFKA_CFG_AUTOBALANCER_REPORTER_METRICS_REPORTING_INTERVAL_MS",
                "5000",
            ),
            value_env("NODEPORT_DEFAULT_PORT", input.node_port.to_string()),
            value_env("OPERATOR_APIS_ADDR", input.config.apis_address()),
        ]);
    }
    if spec.metrics.enable {
        env.push(value_env(
            "KAFKA_CFG_S3_TELEMETRY_METRICS_EXPORTER_URI",
            format!("prometheus://?host=0.0.0.0&port={}", METRICS_PORT),
        ));
    }
    env.extend(role_spec.envs.iter().cloned());
    env
}

fn sysctl_container(image: &str) -> Container {
    Container {
        name: "sysctl".to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            SYSCTLS.join("\n"),
        ]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        resources: Some(ResourceRequirements {
            limits: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("500m".to_string())),
                ("memory".to_string(), Quantity("256Mi".to_string())),
            ])),
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("10m".to_string())),
                ("memory".to_string(), Quantity("64Mi".to_string())),
            ])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod_annotations(input: &WorkloadInput<'_>) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::from([(
        SCRIPT_HASH_ANNOTATION.to_string(),
        input.script_hash.to_string(),
    )]);
    if input.automq.spec.metrics.enable {
        annotations.insert("prometheus.io/scrape".to_string(), "true".to_string());
        annotations.insert("prometheus.io/port".to_string(), METRICS_PORT.to_string());
        annotations.insert("prometheus.io/path".to_string(), "/metrics".to_string());
    }
    annotations
}

/// Single-replica Deployment running the process at `input.role`/`input.index`
pub fn build_deployment(input: &WorkloadInput<'_>) -> Deployment {
    let automq = input.automq;
    let role = input.role;
    let name = resource_name(role, input.index);
    let instance = automq.name_any();
    let pod_labels = index_labels(&instance, role, input.index);
    let role_spec = role.spec(&automq.spec);

    let mut volumes = vec![
        Volume {
            name: SCRIPT_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: instance.clone(),
                default_mode: Some(0o755),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];
    let mut volume_mounts = vec![
        VolumeMount {
            name: name.clone(),
            mount_path: DATA_PATH.to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: SCRIPT_VOLUME.to_string(),
            mount_path: SCRIPT_PATH.to_string(),
            sub_path: Some(SCRIPT_KEY.to_string()),
            read_only: Some(false),
            ..Default::default()
        },
    ];
    if input.config.mount_tz {
        volumes.push(Volume {
            name: TZ_VOLUME.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: LOCALTIME.to_string(),
                type_: Some(String::new()),
            }),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: TZ_VOLUME.to_string(),
            mount_path: LOCALTIME.to_string(),
            ..Default::default()
        });
    }

    let resources = &role_spec.resource;
    let container = Container {
        name: role.to_string(),
        image: Some(automq.spec.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![
            "/bin/bash".to_string(),
            "-c".to_string(),
            startup_args(automq, role, input.index).join(" \\\n"),
        ]),
        env: Some(container_env(input)),
        ports: Some(vec![ContainerPort {
            name: Some(role.to_string()),
            container_port: role.port(),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(volume_mounts),
        lifecycle: Some(Lifecycle {
            pre_stop: Some(LifecycleHandler {
                exec: Some(ExecAction {
                    command: Some(vec![
                        "bash".to_string(),
                        "-c".to_string(),
                        "/opt/kafka/kafka/bin/kafka-server-stop.sh".to_string(),
                    ]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        liveness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::String(role.to_string()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(20),
            timeout_seconds: Some(10),
            period_seconds: Some(30),
            success_threshold: Some(1),
            failure_threshold: Some(4),
            ..Default::default()
        }),
        resources: Some(ResourceRequirements {
            limits: resources.limits.clone(),
            requests: resources.requests.clone(),
            ..Default::default()
        }),
        ..Default::default()
    };

    Deployment {
        metadata: child_meta(automq, name, role_labels(&instance, role)),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(pod_labels.clone()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: Some(pod_annotations(input)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    host_network: Some(false),
                    termination_grace_period_seconds: Some(120),
                    init_containers: Some(vec![sysctl_container(&input.config.busybox_image)]),
                    affinity: role_spec.affinity.as_ref().and_then(|a| {
                        a.to_k8s_affinity(&role_labels(&instance, role))
                    }),
                    volumes: Some(volumes),
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Copies the fields the operator sets from `desired` onto `live`. Fields
/// the API server fills in on admission (restart and DNS policy, scheduler,
/// rolling update bounds, termination message settings) stay as found, so a
/// converged Deployment merges to itself. The selector is immutable once
/// created and is never touched.
pub fn merge_deployment(live: &mut Deployment, desired: &Deployment) {
    merge_meta(&mut live.metadata, &desired.metadata);
    let Some(desired_spec) = desired.spec.as_ref() else {
        return;
    };
    let Some(spec) = live.spec.as_mut() else {
        live.spec = Some(desired_spec.clone());
        return;
    };
    spec.replicas = desired_spec.replicas;
    if let Some(desired_strategy) = &desired_spec.strategy {
        let strategy = spec.strategy.get_or_insert_with(Default::default);
        if strategy.type_ != desired_strategy.type_ {
            *strategy = desired_strategy.clone();
        }
    }
    merge_template(&mut spec.template, &desired_spec.template);
}

fn merge_template(live: &mut PodTemplateSpec, desired: &PodTemplateSpec) {
    if let Some(desired_meta) = &desired.metadata {
        let meta = live.metadata.get_or_insert_with(Default::default);
        meta.labels = desired_meta.labels.clone();
        // Keep annotations added by others, e.g. rollout restarts
        if let Some(annotations) = &desired_meta.annotations {
            meta.annotations
                .get_or_insert_with(Default::default)
                .extend(annotations.clone());
        }
    }
    let Some(desired_pod) = &desired.spec else {
        return;
    };
    let Some(pod) = live.spec.as_mut() else {
        live.spec = Some(desired_pod.clone());
        return;
    };
    pod.host_network = desired_pod.host_network;
    pod.termination_grace_period_seconds = desired_pod.termination_grace_period_seconds;
    pod.affinity = desired_pod.affinity.clone();
    pod.volumes = desired_pod.volumes.clone();
    pod.containers = merge_containers(&pod.containers, &desired_pod.containers);
    pod.init_containers = desired_pod.init_containers.as_ref().map(|desired| {
        merge_containers(pod.init_containers.as_deref().unwrap_or_default(), desired)
    });
}

/// Desired containers in desired order, each overlaid on the live container
/// of the same name when there is one.
fn merge_containers(live: &[Container], desired: &[Container]) -> Vec<Container> {
    desired
        .iter()
        .map(|want| match live.iter().find(|c| c.name == want.name) {
            Some(have) => Container {
                image: want.image.clone(),
                image_pull_policy: want.image_pull_policy.clone(),
                command: want.command.clone(),
                args: want.args.clone(),
                env: want.env.clone(),
                ports: want.ports.clone(),
                volume_mounts: want.volume_mounts.clone(),
                lifecycle: want.lifecycle.clone(),
                liveness_probe: want.liveness_probe.clone(),
                resources: want.resources.clone(),
                security_context: want.security_context.clone(),
                ..have.clone()
            },
            None => want.clone(),
        })
        .collect()
}
