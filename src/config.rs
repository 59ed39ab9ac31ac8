//! Operator configuration from flags and environment.

use crate::error::{OperatorError, Result};
use clap::Parser;
use std::time::Duration;

/// Port of the operator APIs service the brokers query for node addresses
pub const OPERATOR_APIS_PORT: u16 = 9090;

/// AutoMQ Kubernetes Operator
#[derive(Parser, Debug, Clone)]
#[command(name = "automq-operator")]
#[command(version, about = "Kubernetes Operator for AutoMQ clusters")]
pub struct OperatorArgs {
    /// Enable leader election for HA deployments
    #[arg(long, default_value = "false")]
    pub leader_election: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, default_value = "")]
    pub leader_election_namespace: String,

    /// Namespace to watch (empty for all namespaces)
    #[arg(long, default_value = "")]
    pub namespace: String,

    /// Mount the host /etc/localtime into every AutoMQ pod
    #[arg(long, default_value = "false")]
    pub mount_tz: bool,

    /// Interval of the per-cluster status refresh
    #[arg(long, default_value = "5")]
    pub status_refresh_seconds: u64,

    /// Deadline for a single API server request
    #[arg(long, default_value = "30")]
    pub request_timeout_seconds: u64,

    /// Namespace the operator runs in
    #[arg(long, env = "NAMESPACE_NAME", default_value = "default")]
    pub operator_namespace: String,

    /// Name of the operator APIs Service
    #[arg(long, env = "OPERATOR_APIS_SVC_NAME")]
    pub apis_service_name: String,

    /// Image of the sysctl init container
    #[arg(long, default_value = "busybox:1.36")]
    pub busybox_image: String,
}

/// Settings the reconciler and the resource builders read.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// `None` watches every namespace
    pub watch_namespace: Option<String>,
    pub mount_tz: bool,
    pub status_refresh: Duration,
    pub request_timeout: Duration,
    pub operator_namespace: String,
    pub apis_service_name: String,
    pub busybox_image: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            mount_tz: false,
            status_refresh: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            operator_namespace: "default".to_string(),
            apis_service_name: "automq-operator-apis".to_string(),
            busybox_image: "busybox:1.36".to_string(),
        }
    }
}

impl OperatorConfig {
    pub fn from_args(args: &OperatorArgs) -> Result<Self> {
        if args.apis_service_name.trim().is_empty() {
            return Err(OperatorError::Configuration(
                "apis service name must not be empty".to_string(),
            ));
        }
        if args.status_refresh_seconds == 0 {
            return Err(OperatorError::Configuration(
                "status refresh interval must be at least one second".to_string(),
            ));
        }
        if args.request_timeout_seconds == 0 {
            return Err(OperatorError::Configuration(
                "request timeout must be at least one second".to_string(),
            ));
        }

        Ok(Self {
            watch_namespace: Some(args.namespace.clone()).filter(|ns| !ns.is_empty()),
            mount_tz: args.mount_tz,
            status_refresh: Duration::from_secs(args.status_refresh_seconds),
            request_timeout: Duration::from_secs(args.request_timeout_seconds),
            operator_namespace: args.operator_namespace.clone(),
            apis_service_name: args.apis_service_name.clone(),
            busybox_image: args.busybox_image.clone(),
        })
    }

    /// Base URL of the operator APIs, injected into broker pods.
    pub fn apis_address(&self) -> String {
        format!(
            "http://{}.{}.svc:{}",
            self.apis_service_name, self.operator_namespace, OPERATOR_APIS_PORT
        )
    }
}
