use std::time::Duration;

use async_nats::jetstream::kv;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{error::NatsStoreError, traits::ClaimStore};

/// Length of the expiry header in front of every stored value.
const HEADER_LEN: usize = 8;

/// `ClaimStore` backed by a NATS JetStream KV bucket.
///
/// KV buckets only expire entries bucket-wide, so every value carries its own
/// expiry (unix millis, big-endian) in front of the payload. A record whose
/// expiry has passed, or whose latest revision is a delete marker, counts as
/// absent; it is replaced with a revision-checked update so two claimants
/// cannot both take it over.
///
/// Keys are escaped with [`escape_key`] before they reach the bucket.
#[derive(Clone)]
pub struct NatsClaimStore {
    store: kv::Store,
}

impl NatsClaimStore {
    pub fn new(store: kv::Store) -> Self {
        Self { store }
    }

    /// Latest revision of `key` and whether it is still live.
    async fn current(&self, key: &str) -> Result<Option<(u64, bool)>, NatsStoreError> {
        let entry = self.store.entry(key).await.map_err(kv_error)?;
        Ok(entry.map(|e| {
            let live = e.operation == kv::Operation::Put && is_live(&e.value, now_ms());
            (e.revision, live)
        }))
    }

    /// Compare-and-swap on `revision`. `Ok(false)` when someone else wrote
    /// first.
    async fn replace(&self, key: &str, value: Bytes, revision: u64) -> Result<bool, NatsStoreError> {
        match self.store.update(key, value, revision).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == kv::UpdateErrorKind::WrongLastRevision => Ok(false),
            Err(e) => Err(kv_error(e)),
        }
    }
}

impl ClaimStore for NatsClaimStore {
    type Error = NatsStoreError;

    async fn set_if_absent(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool, NatsStoreError> {
        let key = escape_key(key);
        let sealed = seal(&value, expiry_ms(now_ms(), ttl));

        match self.store.create(&key, sealed.clone()).await {
            Ok(_) => return Ok(true),
            Err(e) if e.kind() == kv::CreateErrorKind::AlreadyExists => {}
            Err(e) => return Err(kv_error(e)),
        }

        match self.current(&key).await? {
            Some((_, true)) => Ok(false),
            Some((revision, false)) => {
                tracing::debug!(key = %key, revision, "Taking over expired claim record");
                self.replace(&key, sealed, revision).await
            }
            // Purged between the two calls.
            None => match self.store.create(&key, sealed).await {
                Ok(_) => Ok(true),
                Err(e) if e.kind() == kv::CreateErrorKind::AlreadyExists => Ok(false),
                Err(e) => Err(kv_error(e)),
            },
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool, NatsStoreError> {
        let key = escape_key(key);
        match self.current(&key).await? {
            Some((revision, true)) => {
                let sealed = seal(&value, expiry_ms(now_ms(), ttl));
                self.replace(&key, sealed, revision).await
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<u64, NatsStoreError> {
        let key = escape_key(key);
        match self.current(&key).await? {
            Some((_, live)) => {
                self.store.delete(&key).await.map_err(kv_error)?;
                Ok(u64::from(live))
            }
            None => Ok(0),
        }
    }
}

fn kv_error(e: impl std::fmt::Display) -> NatsStoreError {
    NatsStoreError::Kv(e.to_string())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn expiry_ms(now_ms: i64, ttl: Duration) -> i64 {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now_ms.saturating_add(ttl_ms)
}

/// Prefix `payload` with its expiry.
pub fn seal(payload: &[u8], expires_at_ms: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_i64(expires_at_ms);
    buf.put_slice(payload);
    buf.freeze()
}

/// Split a stored value into expiry and payload. `None` for values too short
/// to carry a header.
pub fn open(raw: &[u8]) -> Option<(i64, &[u8])> {
    if raw.len() < HEADER_LEN {
        return None;
    }
    let (mut header, payload) = raw.split_at(HEADER_LEN);
    Some((header.get_i64(), payload))
}

fn is_live(raw: &[u8], now_ms: i64) -> bool {
    open(raw).is_some_and(|(expires_at, _)| expires_at > now_ms)
}

/// Map an arbitrary key onto the KV key alphabet, injectively.
///
/// `[A-Za-z0-9_/-]` pass through. `.` passes through unless it would open,
/// close or double a token. Every other byte, `=` included, becomes `=XX`.
pub fn escape_key(key: &str) -> String {
    let bytes = key.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    for (i, &b) in bytes.iter().enumerate() {
        let keep = match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'/' => true,
            b'.' => i > 0 && i + 1 < bytes.len() && bytes[i - 1] != b'.',
            _ => false,
        };
        if keep {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("={b:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open() {
        let sealed = seal(br#"{"tick_unix":1800000000}"#, 1_800_000_060_000);
        let (expires_at, payload) = open(&sealed).unwrap();
        assert_eq!(expires_at, 1_800_000_060_000);
        assert_eq!(payload, br#"{"tick_unix":1800000000}"#);
    }

    #[test]
    fn short_values_are_never_live() {
        assert!(open(b"abc").is_none());
        assert!(!is_live(b"abc", 0));
    }

    #[test]
    fn liveness_follows_embedded_expiry() {
        let sealed = seal(b"v", 1_000);
        assert!(is_live(&sealed, 999));
        assert!(!is_live(&sealed, 1_000));
    }

    #[test]
    fn expiry_saturates() {
        assert_eq!(expiry_ms(1_000, Duration::from_secs(2)), 3_000);
        assert_eq!(expiry_ms(i64::MAX - 1, Duration::from_secs(1)), i64::MAX);
    }

    #[test]
    fn plain_keys_pass_through() {
        assert_eq!(escape_key("cron.owner.heartbeat"), "cron.owner.heartbeat");
        assert_eq!(escape_key("cron.tick.1800000000.db-backup_v2"), "cron.tick.1800000000.db-backup_v2");
    }

    #[test]
    fn unsafe_bytes_are_escaped() {
        assert_eq!(escape_key("cron.owner.nightly report"), "cron.owner.nightly=20report");
        assert_eq!(escape_key("cron.owner.a=b"), "cron.owner.a=3Db");
        assert_eq!(escape_key("cron.owner.*>"), "cron.owner.=2A=3E");
        assert_eq!(escape_key("cron.owner.é"), "cron.owner.=C3=A9");
    }

    #[test]
    fn dots_never_form_empty_tokens() {
        assert_eq!(escape_key("cron.owner..hidden"), "cron.owner.=2Ehidden");
        assert_eq!(escape_key("cron.owner.trailing."), "cron.owner.trailing=2E");
        assert_eq!(escape_key(".lead"), "=2Elead");
    }

    #[test]
    fn escaping_is_injective() {
        let keys = ["a=2Eb", "a.b", "a..b", "a =b", "a=20=3Db"];
        let escaped: std::collections::HashSet<String> = keys.iter().map(|k| escape_key(k)).collect();
        assert_eq!(escaped.len(), keys.len());
    }
}
