//! Per-resource periodic status refresh
//!
//! One task per `namespace/name`, started on the first reconcile of that
//! AutoMQ and aborted when it is deleted or the operator shuts down.
//! Repeated reconciles never add tasks.

use crate::api::Shutdown;
use crate::error::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Registry of running refresh tasks
#[derive(Debug, Clone, Default)]
pub struct StatusRefresher {
    tasks: Arc<DashMap<String, JoinHandle<()>>>,
}

impl StatusRefresher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start refreshing `key` every `period` unless a task is already running.
    ///
    /// `tick` returns `Ok(false)` once the resource is gone, which ends the
    /// task. Errors are logged and the task keeps ticking. Returns whether a
    /// task was started.
    pub fn ensure_started<F, Fut>(
        &self,
        key: String,
        period: Duration,
        shutdown: Shutdown,
        tick: F,
    ) -> bool
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        match self.tasks.entry(key.clone()) {
            Entry::Occupied(entry) if !entry.get().is_finished() => false,
            entry => {
                debug!(key = %key, period_ms = period.as_millis() as u64, "starting status refresher");
                let handle = tokio::spawn(refresh_loop(key, period, shutdown, tick));
                match entry {
                    Entry::Occupied(mut occupied) => {
                        occupied.insert(handle);
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(handle);
                    }
                }
                true
            }
        }
    }

    /// Abort the task of `key`, if any.
    pub fn stop(&self, key: &str) -> bool {
        match self.tasks.remove(key) {
            Some((_, handle)) => {
                handle.abort();
                debug!(key = %key, "stopped status refresher");
                true
            }
            None => false,
        }
    }

    /// Abort every task.
    pub fn shutdown(&self) {
        self.tasks.retain(|_, handle| {
            handle.abort();
            false
        });
    }

    /// Number of tasks still running
    pub fn active(&self) -> usize {
        self.tasks
            .iter()
            .filter(|entry| !entry.value().is_finished())
            .count()
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.tasks
            .get(key)
            .is_some_and(|handle| !handle.is_finished())
    }
}

async fn refresh_loop<F, Fut>(key: String, period: Duration, shutdown: Shutdown, tick: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.triggered() => return,
        }
        match tick().await {
            Ok(true) => {}
            Ok(false) => {
                debug!(key = %key, "resource gone, status refresher exiting");
                return;
            }
            Err(e) => warn!(key = %key, error = %e, "failed to refresh status"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::shutdown_channel;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting(counter: Arc<AtomicU32>, keep_going: bool) -> impl Fn() -> std::future::Ready<Result<bool>> + Send + 'static {
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(keep_going))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_task_per_key() {
        let refresher = StatusRefresher::new();
        let counter = Arc::new(AtomicU32::new(0));
        let period = Duration::from_secs(5);

        assert!(refresher.ensure_started("ns/a".into(), period, Shutdown::never(), counting(counter.clone(), true)));
        assert!(!refresher.ensure_started("ns/a".into(), period, Shutdown::never(), counting(counter.clone(), true)));
        assert!(refresher.ensure_started("ns/b".into(), period, Shutdown::never(), counting(counter.clone(), true)));
        assert_eq!(refresher.active(), 2);

        tokio::time::sleep(Duration::from_secs(11)).await;
        // two ticks for each of the two tasks
        assert_eq!(counter.load(Ordering::SeqCst), 4);

        assert!(refresher.stop("ns/a"));
        assert!(!refresher.stop("ns/a"));
        assert_eq!(refresher.active(), 1);
        refresher.shutdown();
        assert_eq!(refresher.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_ends_when_resource_is_gone() {
        let refresher = StatusRefresher::new();
        let counter = Arc::new(AtomicU32::new(0));
        refresher.ensure_started(
            "ns/a".into(),
            Duration::from_secs(1),
            Shutdown::never(),
            counting(counter.clone(), false),
        );
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!refresher.is_running("ns/a"));

        // A finished task is replaced on the next reconcile
        assert!(refresher.ensure_started(
            "ns/a".into(),
            Duration::from_secs(1),
            Shutdown::never(),
            counting(counter, true),
        ));
        refresher.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_signal_stops_tasks() {
        let refresher = StatusRefresher::new();
        let counter = Arc::new(AtomicU32::new(0));
        let (trigger, shutdown) = shutdown_channel();
        refresher.ensure_started("ns/a".into(), Duration::from_secs(1), shutdown, counting(counter.clone(), true));

        trigger.trigger();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(!refresher.is_running("ns/a"));
    }
}
