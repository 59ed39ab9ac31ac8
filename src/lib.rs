//! AutoMQ Kubernetes Operator
//!
//! A Kubernetes operator for deploying and managing AutoMQ clusters: a KRaft
//! controller quorum and a broker group that keep their stream data in
//! object storage.
//!
//! ## Custom Resources
//!
//! - `AutoMQ`: one cluster. Every controller and broker index gets its own
//!   PersistentVolumeClaim, Service and Deployment.
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: infra.cuisongliu.github.com/v1beta1
//! kind: AutoMQ
//! metadata:
//!   name: automq
//! spec:
//!   s3:
//!     endpoint: http://minio.storage:9000
//!     accessKeyID: admin
//!     secretAccessKey: password
//!     bucket: automq
//!     enablePathStyle: true
//!   controller:
//!     replicas: 3
//!   broker:
//!     replicas: 2
//! ```

pub mod api;
pub mod conditions;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod leader_election;
pub mod quorum;
pub mod resources;
pub mod storage;

pub use controllers::AutoMQReconciler;
pub use crd::{AutoMQ, AutoMQPhase, AutoMQSpec, AutoMQStatus, RoleSpec, S3Spec};
pub use error::{OperatorError, Result};
