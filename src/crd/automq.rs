//! AutoMQ Custom Resource Definition
//!
//! Declares an AutoMQ cluster: an object-storage target, a cluster id and two
//! homogeneous role groups (controllers and brokers).

use super::affinity::AffinitySpec;
use crate::conditions::Conditions;
use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// AutoMQ is the Schema for the automqs API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "infra.cuisongliu.github.com",
    version = "v1beta1",
    kind = "AutoMQ",
    plural = "automqs",
    namespaced,
    status = "AutoMQStatus",
    shortname = "amq",
    printcolumn = r#"{"name":"Controllers","type":"integer","jsonPath":".spec.controller.replicas"}"#,
    printcolumn = r#"{"name":"Brokers","type":"integer","jsonPath":".spec.broker.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyPods"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AutoMQSpec {
    /// Object storage target. Endpoint, region and bucket are immutable.
    #[serde(default)]
    pub s3: S3Spec,

    /// Cluster id shared by every node. Immutable.
    #[serde(rename = "clusterID", default = "default_cluster_id")]
    pub cluster_id: String,

    /// AutoMQ container image
    #[serde(default = "default_image")]
    pub image: String,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsSpec,

    /// Node port of the bootstrap service
    #[serde(default)]
    pub node_port: Option<i32>,

    /// Controller role group
    #[serde(default = "default_controller")]
    pub controller: RoleSpec,

    /// Broker role group
    #[serde(default = "default_broker")]
    pub broker: RoleSpec,
}

/// Object storage target
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct S3Spec {
    /// Endpoint of the S3 service
    #[serde(default)]
    pub endpoint: String,
    /// Region of the S3 service
    #[serde(default = "default_region")]
    pub region: String,
    /// Access key id
    #[serde(rename = "accessKeyID", default)]
    pub access_key_id: String,
    /// Secret access key
    #[serde(default)]
    pub secret_access_key: String,
    /// Bucket holding the stream data
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Use path-style bucket addressing
    #[serde(default)]
    pub enable_path_style: bool,
}

impl Default for S3Spec {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            region: default_region(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            bucket: default_bucket(),
            enable_path_style: false,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSpec {
    /// Expose the prometheus exporter on every node
    #[serde(default)]
    pub enable: bool,
    /// Import the bundled dashboard
    #[serde(default)]
    pub import_dashboard: bool,
}

/// Configuration shared by the controller and broker role groups
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RoleSpec {
    /// Number of replicas in the role group
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    /// JVM options, joined into KAFKA_HEAP_OPTS
    #[serde(default)]
    pub jvm_options: Vec<String>,
    /// Extra environment variables appended to the container
    #[serde(default)]
    pub envs: Vec<EnvVar>,
    /// Resource requirements for the container
    #[serde(default)]
    pub resource: ResourceRequirements,
    /// Placement affinity
    #[serde(default)]
    pub affinity: Option<AffinitySpec>,
    /// Storage class of the data volume
    #[serde(default)]
    pub storage_class: Option<String>,
}

/// Status of the AutoMQ cluster
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoMQStatus {
    /// Current phase
    #[serde(default)]
    pub phase: AutoMQPhase,
    /// Sub-step conditions, keyed by type
    #[serde(default)]
    pub conditions: Conditions,
    /// Controller replicas last materialized
    #[serde(default)]
    pub controller_replicas: i32,
    /// Broker replicas last materialized
    #[serde(default)]
    pub broker_replicas: i32,
    /// Running and ready pods across both roles
    #[serde(default)]
    pub ready_pods: i32,
    /// Quorum voters, `<id>@<host>:<port>`, in id order
    #[serde(default)]
    pub controller_addresses: Vec<String>,
    /// In-cluster bootstrap address of the brokers
    #[serde(default)]
    pub bootstrap_internal_address: String,
}

/// Phase of the cluster, recomputed on every status refresh
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum AutoMQPhase {
    #[default]
    Pending,
    InProcess,
    Ready,
    Error,
}

impl fmt::Display for AutoMQPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AutoMQPhase::Pending => "Pending",
            AutoMQPhase::InProcess => "InProcess",
            AutoMQPhase::Ready => "Ready",
            AutoMQPhase::Error => "Error",
        };
        f.write_str(s)
    }
}

impl AutoMQ {
    /// Status observed so far, or the empty status for a fresh object.
    pub fn status_or_default(&self) -> AutoMQStatus {
        self.status.clone().unwrap_or_default()
    }
}

// Default value functions
fn default_cluster_id() -> String {
    "rZdE0DjZSrqy96PXrMUZVw".to_string()
}

fn default_image() -> String {
    "automqinc/automq:1.2.0-rc1".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_bucket() -> String {
    "ko3".to_string()
}

fn default_replicas() -> i32 {
    1
}

fn default_controller() -> RoleSpec {
    RoleSpec {
        replicas: default_replicas(),
        jvm_options: vec![
            "-Xms1g".to_string(),
            "-Xmx1g".to_string(),
            "-XX:MetaspaceSize=96m".to_string(),
        ],
        ..Default::default()
    }
}

fn default_broker() -> RoleSpec {
    RoleSpec {
        replicas: default_replicas(),
        jvm_options: vec![
            "-Xms1g".to_string(),
            "-Xmx1g".to_string(),
            "-XX:MetaspaceSize=96m".to_string(),
            "-XX:MaxDirectMemorySize=1G".to_string(),
        ],
        ..Default::default()
    }
}
