//! In-process bucket used by tests and dry runs.

use super::{Bucket, BucketFactory, StorageConfig};
use crate::api::Shutdown;
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Inner {
    buckets: BTreeSet<String>,
    objects: BTreeMap<(String, String), Vec<u8>>,
    failure: Option<String>,
}

/// Buckets and objects held in memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBucket {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBucket {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| OperatorError::InvalidState("memory bucket lock poisoned".to_string()))
    }

    /// Fail every subsequent call with `message` until [`Self::recover`].
    pub fn fail_with(&self, message: &str) {
        if let Ok(mut inner) = self.lock() {
            inner.failure = Some(message.to_string());
        }
    }

    pub fn recover(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.failure = None;
        }
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.lock()
            .map(|inner| inner.buckets.contains(bucket))
            .unwrap_or(false)
    }

    fn checked(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self.lock()?;
        match &inner.failure {
            Some(message) => Err(OperatorError::Storage(message.clone())),
            None => Ok(inner),
        }
    }
}

fn require_bucket(inner: &Inner, bucket: &str) -> Result<()> {
    if inner.buckets.contains(bucket) {
        Ok(())
    } else {
        Err(OperatorError::NotFound(format!("bucket {}", bucket)))
    }
}

#[async_trait]
impl Bucket for MemoryBucket {
    async fn mk_bucket(&self, bucket: &str) -> Result<()> {
        self.checked()?.buckets.insert(bucket.to_string());
        Ok(())
    }

    async fn upload(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        let mut inner = self.checked()?;
        require_bucket(&inner, bucket)?;
        inner
            .objects
            .insert((bucket.to_string(), key.to_string()), data);
        Ok(())
    }

    async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let inner = self.checked()?;
        require_bucket(&inner, bucket)?;
        inner
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| OperatorError::NotFound(format!("{}/{}", bucket, key)))
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let inner = self.checked()?;
        require_bucket(&inner, bucket)?;
        Ok(inner
            .objects
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect())
    }
}

/// Hands out the same [`MemoryBucket`] for every configuration.
#[derive(Debug, Clone, Default)]
pub struct MemoryBucketFactory {
    bucket: MemoryBucket,
}

impl MemoryBucketFactory {
    pub fn new(bucket: MemoryBucket) -> Self {
        Self { bucket }
    }

    pub fn bucket(&self) -> &MemoryBucket {
        &self.bucket
    }
}

impl BucketFactory for MemoryBucketFactory {
    fn open(&self, _config: &StorageConfig, _shutdown: &Shutdown) -> Result<Arc<dyn Bucket>> {
        Ok(Arc::new(self.bucket.clone()))
    }
}
