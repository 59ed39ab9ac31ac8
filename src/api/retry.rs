//! Conflict retry with bounded exponential backoff, and the shutdown signal
//! retry loops observe between attempts.

use crate::error::{OperatorError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Bounded exponential backoff for optimistic-concurrency conflicts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    pub initial_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_millis(10),
            factor: 2,
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let scaled = self
            .initial_delay
            .saturating_mul(self.factor.saturating_pow(retry));
        scaled.min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails with a non-conflict error, the attempts
/// run out, or shutdown is signalled.
pub async fn retry_on_conflict<T, F, Fut>(
    policy: &RetryPolicy,
    shutdown: &Shutdown,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry = 0;
    loop {
        if shutdown.is_triggered() {
            return Err(OperatorError::Cancelled(
                "shutdown requested before write".to_string(),
            ));
        }
        match op().await {
            Err(e) if e.is_conflict() && retry + 1 < policy.attempts => {
                let delay = policy.delay(retry);
                debug!(attempt = retry + 1, delay_ms = delay.as_millis() as u64, "write conflict, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.triggered() => {
                        return Err(OperatorError::Cancelled(
                            "shutdown requested during conflict backoff".to_string(),
                        ));
                    }
                }
                retry += 1;
            }
            other => return other,
        }
    }
}

/// Receiving side of the process shutdown signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Sending side of the process shutdown signal.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Create a connected trigger/signal pair.
pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is signalled.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Trigger dropped without firing
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(10));
        assert_eq!(policy.delay(1), Duration::from_millis(20));
        assert_eq!(policy.delay(3), Duration::from_millis(80));
        assert_eq!(policy.delay(20), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_stops_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_on_conflict(&RetryPolicy::default(), &Shutdown::never(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(OperatorError::Conflict("stale".to_string())) }
        })
        .await;
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_on_conflict(&RetryPolicy::default(), &Shutdown::never(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(OperatorError::KubeApi("boom".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(OperatorError::KubeApi(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_retry() {
        let (trigger, shutdown) = shutdown_channel();
        trigger.trigger();
        let result: Result<()> =
            retry_on_conflict(&RetryPolicy::default(), &shutdown, || async { Ok(()) }).await;
        assert!(matches!(result, Err(OperatorError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_triggered_resolves() {
        let (trigger, shutdown) = shutdown_channel();
        let waiter = tokio::spawn(async move { shutdown.triggered().await });
        trigger.trigger();
        waiter.await.unwrap();
    }
}
