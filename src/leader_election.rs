//! Kubernetes Lease-based leader election for HA operator deployments.
//!
//! When several operator replicas run, only the holder of the Lease runs
//! the AutoMQ controller. The others block in [`LeaderElector::acquire`]
//! until the current holder releases the lease or lets it expire. Losing
//! the lease stops the process.

use crate::api::ClusterApi;
use crate::error::Result;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const LEASE_NAME: &str = "automq-operator-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Detects the namespace for leader election.
///
/// Priority: explicit argument → service account file → `"default"`.
pub fn detect_namespace(explicit: &str) -> String {
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "default".to_string())
}

/// Identity of this replica: pod name, hostname, or a random suffix.
pub fn detect_identity() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("automq-operator-{:08x}", rand::random::<u32>()))
}

/// Lease holder with optimistic concurrency on `resourceVersion`.
pub struct LeaderElector<A: ClusterApi> {
    api: Arc<A>,
    namespace: String,
    identity: String,
}

fn holder(lease: &Lease) -> Option<&str> {
    lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref())
}

impl<A: ClusterApi> LeaderElector<A> {
    pub fn new(api: Arc<A>, namespace: &str, identity: String) -> Self {
        info!(identity = %identity, namespace = %namespace, "initialized leader elector");
        Self {
            api,
            namespace: namespace.to_string(),
            identity,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Blocks until the lease is acquired.
    pub async fn acquire(&self) -> Result<()> {
        info!(identity = %self.identity, lease = LEASE_NAME, "waiting to acquire leader lease");
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(identity = %self.identity, "acquired leader lease");
                    return Ok(());
                }
                Ok(false) => {
                    debug!(retry_in = ?RETRY_INTERVAL, "lease held by another instance");
                }
                Err(e) => {
                    warn!(error = %e, retry_in = ?RETRY_INTERVAL, "lease acquisition failed");
                }
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Renews the lease. `Ok(true)` while still leader, `Ok(false)` once lost.
    pub async fn renew(&self) -> Result<bool> {
        let Some(lease) = self.api.get::<Lease>(&self.namespace, LEASE_NAME).await? else {
            return Ok(false);
        };
        if holder(&lease) != Some(self.identity.as_str()) {
            return Ok(false);
        }

        let mut updated = lease;
        if let Some(spec) = updated.spec.as_mut() {
            spec.renew_time = Some(MicroTime(Utc::now()));
        }
        match self.api.replace(&self.namespace, &updated).await {
            Ok(_) => {
                debug!("renewed leader lease");
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                warn!("lease conflict during renewal, leadership lost");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Clears the holder so a standby can take over without waiting for expiry.
    pub async fn release(&self) {
        let lease = match self.api.get::<Lease>(&self.namespace, LEASE_NAME).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "failed to read lease for release");
                return;
            }
        };
        if holder(&lease) != Some(self.identity.as_str()) {
            debug!("lease not held by us, skipping release");
            return;
        }

        let mut updated = lease;
        if let Some(spec) = updated.spec.as_mut() {
            spec.holder_identity = None;
        }
        match self.api.replace(&self.namespace, &updated).await {
            Ok(_) => info!(identity = %self.identity, "released leader lease"),
            Err(e) => warn!(error = %e, "failed to release leader lease"),
        }
    }

    /// Recommended interval between renewals.
    pub fn renew_interval(&self) -> Duration {
        RENEW_INTERVAL
    }

    /// One acquisition attempt. `Ok(false)` when someone else holds a live lease.
    pub async fn try_acquire(&self) -> Result<bool> {
        let now = MicroTime(Utc::now());
        match self.api.get::<Lease>(&self.namespace, LEASE_NAME).await? {
            Some(existing) => {
                if holder(&existing) == Some(self.identity.as_str()) {
                    self.update_lease(existing, now, false).await
                } else if holder(&existing).is_none() || is_expired(existing.spec.as_ref()) {
                    self.update_lease(existing, now, true).await
                } else {
                    Ok(false)
                }
            }
            None => self.create_lease(now).await,
        }
    }

    async fn create_lease(&self, now: MicroTime) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION_SECS),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };
        match self.api.create(&self.namespace, &lease).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn update_lease(&self, existing: Lease, now: MicroTime, takeover: bool) -> Result<bool> {
        let prev = existing.spec.clone().unwrap_or_default();
        let transitions = prev.lease_transitions.unwrap_or(0);

        let mut updated = existing;
        updated.spec = Some(LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION_SECS),
            acquire_time: if takeover {
                Some(now.clone())
            } else {
                prev.acquire_time.clone()
            },
            renew_time: Some(now),
            lease_transitions: Some(if takeover { transitions + 1 } else { transitions }),
            ..prev
        });

        match self.api.replace(&self.namespace, &updated).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn is_expired(spec: Option<&LeaseSpec>) -> bool {
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec
        .and_then(|s| s.lease_duration_seconds)
        .unwrap_or(LEASE_DURATION_SECS) as i64;

    match renew_time {
        Some(MicroTime(t)) => Utc::now().signed_duration_since(*t).num_seconds() > duration_secs,
        None => true,
    }
}
