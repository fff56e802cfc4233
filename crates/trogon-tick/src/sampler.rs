//! Drift-tolerant wall-clock sampling.
//!
//! Each process polls the clock on its own jittered cadence instead of
//! aligning to second boundaries. With `base + jitter` below one second every
//! wall-clock second is observed at least once, while independent processes
//! spread their store calls across the second rather than firing together.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;

/// Delay before the next sample: `base` plus a uniform fraction of `jitter`.
pub fn drift_interval(base: Duration, jitter: Duration) -> Duration {
    base + jitter.mul_f64(rand::random::<f64>())
}

/// Lazy, infinite sequence of clock samples, one per drift interval.
///
/// The stream ends (and never resumes) as soon as `scope` is cancelled,
/// including while it is waiting for the next sample.
pub fn samples<C: Clock>(
    clock: C,
    base: Duration,
    jitter: Duration,
    scope: CancellationToken,
) -> impl Stream<Item = DateTime<Utc>> + Send {
    futures::stream::unfold((clock, scope), move |(clock, scope)| async move {
        let delay = drift_interval(base, jitter);
        tokio::select! {
            biased;
            _ = scope.cancelled() => None,
            _ = tokio::time::sleep(delay) => {
                let now = clock.now();
                Some((now, (clock, scope)))
            }
        }
    })
}
