//! Object storage capability
//!
//! AutoMQ keeps its stream data in a bucket. The reconciler only needs the
//! bucket to exist; the rest of [`Bucket`] is what the workloads and tooling
//! use against the same backend. Backends are chosen by [`StorageBackend`]
//! when a bucket handle is opened.

pub mod memory;
mod s3;

pub use s3::S3Bucket;

use crate::api::Shutdown;
use crate::crd::S3Spec;
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Blob store operations
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Create the bucket. Succeeds when it already exists and is ours.
    async fn mk_bucket(&self, bucket: &str) -> Result<()>;

    async fn upload(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()>;

    async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// Keys under `prefix`, in lexical order.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;
}

/// Backend tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    #[default]
    S3,
}

impl FromStr for StorageBackend {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "s3" => Ok(StorageBackend::S3),
            other => Err(OperatorError::Configuration(format!(
                "unsupported storage backend: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::S3 => write!(f, "s3"),
        }
    }
}

/// Connection settings for a bucket handle
#[derive(Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub endpoint: String,
    pub path_style: bool,
    /// Attempts for a single request, including the first
    pub max_retry_attempts: u32,
    /// Upper bound on the delay between attempts
    pub max_backoff: Duration,
    pub request_timeout: Duration,
    /// No retry is started once this much time has passed since the first attempt
    pub max_elapsed: Duration,
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("backend", &self.backend)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("path_style", &self.path_style)
            .finish_non_exhaustive()
    }
}

impl StorageConfig {
    /// Settings for the object storage declared on an AutoMQ.
    pub fn from_spec(spec: &S3Spec) -> Self {
        Self {
            backend: StorageBackend::S3,
            access_key: spec.access_key_id.clone(),
            secret_key: spec.secret_access_key.clone(),
            region: spec.region.clone(),
            endpoint: normalize_endpoint(&spec.endpoint),
            path_style: spec.enable_path_style,
            max_retry_attempts: 3,
            max_backoff: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(30),
        }
    }
}

/// Endpoints without a scheme are plain http.
pub fn normalize_endpoint(endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", endpoint.trim_end_matches('/'))
    }
}

/// Opens bucket handles for a storage configuration. Requests made through
/// the handle give up with `Cancelled` once `shutdown` fires.
pub trait BucketFactory: Send + Sync {
    fn open(&self, config: &StorageConfig, shutdown: &Shutdown) -> Result<Arc<dyn Bucket>>;
}

/// Selects the implementation from [`StorageConfig::backend`].
#[derive(Debug, Clone, Default)]
pub struct BackendFactory;

impl BucketFactory for BackendFactory {
    fn open(&self, config: &StorageConfig, shutdown: &Shutdown) -> Result<Arc<dyn Bucket>> {
        match config.backend {
            StorageBackend::S3 => Ok(Arc::new(
                S3Bucket::new(config.clone())?.with_shutdown(shutdown.clone()),
            )),
        }
    }
}
