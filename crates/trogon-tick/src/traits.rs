use bytes::Bytes;
use std::future::Future;
use std::time::Duration;

/// Shared key-value store holding claim records.
///
/// Every operation must be atomic on the store side. The engine holds no
/// in-process lock over the records.
pub trait ClaimStore: Send + Sync + Clone + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Create `key` with `value` expiring after `ttl`, only if no live record
    /// exists. `Ok(true)` iff this call created the record.
    fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// Overwrite a live record and reset its TTL to `ttl`.
    ///
    /// Never resurrects an expired or deleted record: returns `Ok(false)` and
    /// writes nothing when `key` is not live.
    fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// Remove `key`. Returns the number of live records removed (0 or 1).
    fn delete(&self, key: &str) -> impl Future<Output = Result<u64, Self::Error>> + Send;
}
