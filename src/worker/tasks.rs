//! Background task plumbing for the worker runtime.
//!
//! Named tasks with one broadcast shutdown signal. Periodic tasks add a
//! random jitter to each tick so a fleet started in unison does not scan the
//! store in lockstep.

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Spawns and tracks the runtime's background loops.
pub struct TaskRegistry {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    shutdown_tx: broadcast::Sender<()>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: Vec::new(),
            shutdown_tx,
        }
    }

    /// Spawn a named task that ends when it completes or shutdown fires,
    /// whichever comes first.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task => debug!(task = name, "background task completed"),
                _ = shutdown_rx.recv() => debug!(task = name, "background task stopped"),
            }
        });
        self.tasks.push((name, handle));
    }

    /// Spawn a task that runs `work` every `period`, each tick delayed by a
    /// random jitter of up to `jitter_fraction` of the period.
    pub fn spawn_periodic<W, Fut>(
        &mut self,
        name: &'static str,
        period: Duration,
        jitter_fraction: f64,
        mut work: W,
    ) where
        W: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.spawn(name, async move {
            loop {
                tokio::time::sleep(jittered(period, jitter_fraction)).await;
                work().await;
            }
        });
    }

    /// Number of tasks still running.
    pub fn running_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .count()
    }

    /// Signal shutdown and wait up to `timeout` for every task; stragglers
    /// are aborted.
    pub async fn shutdown(&mut self, timeout: Duration) {
        let _ = self.shutdown_tx.send(());

        let deadline = tokio::time::Instant::now() + timeout;
        for (name, handle) in self.tasks.drain(..) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!(task = name, "aborting task, shutdown timeout exceeded");
                handle.abort();
                continue;
            }
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => debug!(task = name, "task shut down"),
                Ok(Err(e)) if e.is_panic() => warn!(task = name, "task panicked during shutdown"),
                Ok(Err(_)) => {}
                Err(_) => warn!(task = name, "task ignored shutdown signal, aborted"),
            }
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskRegistry {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        for (_, handle) in self.tasks.drain(..) {
            handle.abort();
        }
    }
}

/// `period` plus up to `fraction` of it, uniformly at random.
pub(crate) fn jittered(period: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 {
        return period;
    }
    let jitter = period.mul_f64(fraction.clamp(0.0, 1.0) * fastrand::f64());
    period + jitter
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        let mut registry = TaskRegistry::new();
        registry.spawn("forever", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert_eq!(registry.running_count(), 1);

        registry.shutdown(Duration::from_millis(500)).await;
        assert_eq!(registry.running_count(), 0);
    }

    #[tokio::test]
    async fn test_periodic_task_ticks() {
        let mut registry = TaskRegistry::new();
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&ticks);

        registry.spawn_periodic("ticker", Duration::from_millis(10), 0.0, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        registry.shutdown(Duration::from_millis(200)).await;

        assert!(ticks.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_drop_aborts_tasks() {
        let finished = Arc::new(AtomicU32::new(0));
        let flag = Arc::clone(&finished);
        {
            let mut registry = TaskRegistry::new();
            registry.spawn("orphan", async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                flag.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_jitter_bounds() {
        let period = Duration::from_millis(100);
        for _ in 0..50 {
            let d = jittered(period, 0.5);
            assert!(d >= period);
            assert!(d <= period + Duration::from_millis(50));
        }
        assert_eq!(jittered(period, 0.0), period);
    }
}
