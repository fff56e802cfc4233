use async_nats::jetstream::{self, kv};
use std::time::Duration;

use crate::error::NatsStoreError;

pub const CLAIM_BUCKET: &str = "cron_claims";

/// Bucket-wide purge age. Claim records carry their own expiry; this only
/// sweeps entries nobody will ever read again, so it must exceed the longest
/// job period plus lease TTL.
pub const CLAIM_BUCKET_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// `max_age` for a bucket holding jobs of `period`: at least
/// [`CLAIM_BUCKET_MAX_AGE`], and never shorter than twice a per-tick record's
/// lifetime.
pub fn claim_bucket_max_age(period: Duration, lease_ttl: Duration) -> Duration {
    CLAIM_BUCKET_MAX_AGE.max(period.saturating_add(lease_ttl).saturating_mul(2))
}

pub async fn get_or_create_claim_bucket(
    js: &jetstream::Context,
    bucket: &str,
    max_age: Duration,
) -> Result<kv::Store, NatsStoreError> {
    let config = kv::Config {
        bucket: bucket.to_string(),
        // Only the latest revision matters for compare-and-swap.
        history: 1,
        max_age,
        ..Default::default()
    };
    match js.create_key_value(config).await {
        Ok(store) => Ok(store),
        Err(_) => js
            .get_key_value(bucket)
            .await
            .map_err(|e| NatsStoreError::Kv(e.to_string())),
    }
}
