//! Wall-clock abstraction.
//!
//! - `SystemClock`: delegates to `chrono::Utc::now()`
//! - `MockClock`: wall time derived from tokio's clock, so under
//!   `#[tokio::test(start_paused = true)]` every `tokio::time::sleep` in the
//!   engine moves the mocked wall clock forward by exactly the slept amount.

use chrono::{DateTime, Utc};

/// Source of wall-clock time. Ticks are epoch seconds, so this is the only
/// notion of "now" the engine uses for scheduling.
pub trait Clock: Send + Sync + Clone + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(any(test, feature = "test-support"))]
pub use mock::MockClock;

#[cfg(any(test, feature = "test-support"))]
mod mock {
    use std::sync::{Arc, Mutex};

    use chrono::{DateTime, Utc};
    use tokio::time::Instant;

    use super::Clock;

    /// Wall clock pinned to a start instant that advances with tokio time.
    ///
    /// Clones share state, so several engines built from clones of one
    /// `MockClock` agree on the time, the way processes with synchronised
    /// clocks would.
    #[derive(Clone)]
    pub struct MockClock {
        inner: Arc<Mutex<Anchor>>,
    }

    struct Anchor {
        wall: DateTime<Utc>,
        at: Instant,
    }

    impl MockClock {
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                inner: Arc::new(Mutex::new(Anchor {
                    wall: start,
                    at: Instant::now(),
                })),
            }
        }

        /// Start at `secs` seconds after the unix epoch.
        pub fn at_unix(secs: i64) -> Self {
            Self::new(DateTime::from_timestamp(secs, 0).unwrap_or_default())
        }

        /// Jump the wall clock without moving tokio time (an NTP step).
        pub fn set(&self, wall: DateTime<Utc>) {
            let mut anchor = self.inner.lock().unwrap();
            anchor.wall = wall;
            anchor.at = Instant::now();
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> DateTime<Utc> {
            let anchor = self.inner.lock().unwrap();
            let elapsed = Instant::now().saturating_duration_since(anchor.at);
            anchor.wall + chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn system_clock_is_close_to_utc_now() {
        let before = Utc::now();
        let now = SystemClock.now();
        assert!(now >= before);
        assert!(now - before < chrono::Duration::seconds(1));
    }

    #[tokio::test(start_paused = true)]
    async fn mock_clock_follows_tokio_time() {
        let clock = MockClock::at_unix(1_800_000_000);
        assert_eq!(clock.now().timestamp(), 1_800_000_000);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(clock.now().timestamp(), 1_800_000_001);
        assert_eq!(clock.now().timestamp_subsec_millis(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn mock_clock_clones_share_time() {
        let clock = MockClock::at_unix(100);
        let other = clock.clone();

        clock.set(DateTime::from_timestamp(500, 0).unwrap());
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(other.now().timestamp(), 502);
    }
}
