//! Custom Resource Definitions for the AutoMQ Kubernetes Operator
//!
//! - AutoMQ: one AutoMQ cluster (controllers + brokers) backed by object storage

mod affinity;
mod automq;

pub use affinity::{AffinitySpec, NodeAffinity, NodeSelector, PodAffinity};
pub use automq::{AutoMQ, AutoMQPhase, AutoMQSpec, AutoMQStatus, MetricsSpec, RoleSpec, S3Spec};
