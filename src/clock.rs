//! Wall and monotonic time sources behind one seam.
//!
//! Lease expiry is judged against wall timestamps persisted in rows
//! (`heartbeat_at`), so small clock skew between workers is tolerated by the
//! `steal_grace` margin rather than hidden. Local measurements (tick pacing,
//! uptime) use the monotonic reading. Tests drive a [`ManualClock`].

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Time source used by every component that stamps or compares timestamps.
pub trait Clock: Send + Sync {
    /// Wall time, persisted in rows and compared against `failover_timeout`
    /// and `steal_grace`.
    fn wall(&self) -> DateTime<Utc>;

    /// Monotonic reading for local measurements.
    fn mono(&self) -> Instant;
}

/// Production clock backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn mono(&self) -> Instant {
        Instant::now()
    }
}

/// Test clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    start_wall: DateTime<Utc>,
    start_mono: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Start the clock at the given wall time with zero offset.
    pub fn starting_at(start_wall: DateTime<Utc>) -> Self {
        Self {
            start_wall,
            start_mono: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Advance both readings by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut offset = self.offset.lock().expect("clock offset poisoned");
        *offset += delta;
    }

    fn offset(&self) -> Duration {
        *self.offset.lock().expect("clock offset poisoned")
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::starting_at(Utc::now())
    }
}

impl Clock for ManualClock {
    fn wall(&self) -> DateTime<Utc> {
        self.start_wall
            + chrono::Duration::from_std(self.offset()).unwrap_or(chrono::Duration::MAX)
    }

    fn mono(&self) -> Instant {
        self.start_mono + self.offset()
    }
}
