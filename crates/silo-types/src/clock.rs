//! The injected clock capability.
//!
//! Every timer in the host (bus deadlines, Raft elections, WORM expiry)
//! reads time through [`Clock`] rather than the ambient system clock, so
//! tests drive time deterministically with [`ManualClock`].

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Wall-clock and sleep capability injected into every timed subsystem.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Suspend the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Deterministic test clock advanced explicitly by the test body.
///
/// `sleep` suspends until `advance` has moved virtual time past the wake
/// deadline; sleepers never wake spuriously early.
#[derive(Debug)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
    tick: Notify,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: std::sync::Mutex::new(start),
            tick: Notify::new(),
        })
    }

    /// Advance virtual time, waking every sleeper whose deadline passed.
    pub fn advance(&self, duration: Duration) {
        {
            let mut now = self.now.lock().expect("clock mutex poisoned");
            *now += ChronoDuration::from_std(duration).expect("duration out of range");
        }
        self.tick.notify_waiters();
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock mutex poisoned")
    }

    async fn sleep(&self, duration: Duration) {
        let deadline =
            self.now_utc() + ChronoDuration::from_std(duration).expect("duration out of range");
        loop {
            // Register interest before re-checking to avoid a lost wakeup
            // between the comparison and the await.
            let notified = self.tick.notified();
            if self.now_utc() >= deadline {
                return;
            }
            notified.await;
        }
    }
}
