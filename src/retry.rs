//! Named retry policies for consistent backoff behavior.
//!
//! All policies come from the `backon` crate and include jitter so a fleet
//! of workers restarting together does not hammer the store in lockstep.
//!
//! | Policy | Min delay | Max delay | Retries | Use |
//! |--------|-----------|-----------|---------|-----|
//! | `store_policy` | 25ms | 1s | 4 | Lease store reads and scans |
//! | `probe_policy` | 100ms | 5s | 3 | Topology and fleet probes |
//! | `startup_policy` | 50ms | 5s | 10 | First cap resolution at boot |

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

/// Policy for lease store reads and scans.
///
/// Short delays and few attempts: a store that stays down is handled by the
/// tick being dropped and the lease expiring naturally.
pub fn store_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(25))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(4)
        .with_jitter()
}

/// Policy for topology and fleet probe calls.
pub fn probe_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(3)
        .with_jitter()
}

/// Policy for the initial cap resolution at worker startup.
///
/// Generous: until a cap is adopted the worker cannot take any lease, so it
/// is worth riding out a slow store or a coordination stampede.
pub fn startup_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(10)
        .with_jitter()
}

/// Run `operation` under `store_policy`, retrying while `condition` holds.
pub async fn with_store_policy<F, Fut, T, E, C>(operation: F, condition: C) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    C: FnMut(&E) -> bool,
{
    operation.retry(store_policy()).when(condition).await
}

/// Run `operation` under `probe_policy`, retrying while `condition` holds.
pub async fn with_probe_policy<F, Fut, T, E, C>(operation: F, condition: C) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    C: FnMut(&E) -> bool,
{
    operation.retry(probe_policy()).when(condition).await
}

/// Run `operation` under `startup_policy`, retrying while `condition` holds.
pub async fn with_startup_policy<F, Fut, T, E, C>(operation: F, condition: C) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    C: FnMut(&E) -> bool,
{
    operation.retry(startup_policy()).when(condition).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);

        let result = with_store_policy(
            || {
                let attempts = &attempts;
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout"))
                    } else {
                        Ok(7)
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_respects_condition() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), std::io::Error> = with_store_policy(
            || {
                let attempts = &attempts;
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "not found",
                    ))
                }
            },
            |e| e.kind() == std::io::ErrorKind::TimedOut,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_store_policy_exhausts() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), std::io::Error> = (|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout"))
        })
        .retry(store_policy())
        .when(|_| true)
        .await;

        assert!(result.is_err());
        // Initial attempt plus four retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }
}
