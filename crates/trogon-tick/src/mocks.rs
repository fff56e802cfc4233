//! In-memory store for unit testing without a real NATS server.
//!
//! Enabled with the `test-support` feature:
//!
//! ```toml
//! [dev-dependencies]
//! trogon-tick = { path = "...", features = ["test-support"] }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::traits::ClaimStore;

// ── MemoryClaimStore ──────────────────────────────────────────────────────────

/// Store operation selector for fault injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    SetIfAbsent,
    Set,
    Delete,
}

/// One recorded store call, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCall {
    pub op: MockOp,
    pub key: String,
    pub ttl: Option<Duration>,
}

/// Shared in-memory claim store with TTL expiry.
///
/// Expiry is measured on `tokio::time::Instant`, so paused-time tests see
/// records expire exactly when tokio time passes their TTL. Clones share the
/// same records, which is how tests model several processes talking to one
/// store.
#[derive(Clone, Default)]
pub struct MemoryClaimStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, Record>,
    failing: HashSet<MockOp>,
    latency: Duration,
    calls: Vec<StoreCall>,
}

struct Record {
    value: Bytes,
    expires_at: Instant,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

impl MemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every later call of `op` fails with a [`MockStoreError`].
    pub fn fail(&self, op: MockOp) {
        self.inner.lock().unwrap().failing.insert(op);
    }

    pub fn recover(&self, op: MockOp) {
        self.inner.lock().unwrap().failing.remove(&op);
    }

    /// Delay every call by `latency` before it takes effect.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().unwrap().latency = latency;
    }

    /// Drop a record out from under its owner, like a store eviction.
    pub fn evict(&self, key: &str) -> bool {
        self.inner.lock().unwrap().records.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.inner
            .lock()
            .unwrap()
            .records
            .get(key)
            .is_some_and(|r| r.is_live(now))
    }

    pub fn value(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        self.inner
            .lock()
            .unwrap()
            .records
            .get(key)
            .filter(|r| r.is_live(now))
            .map(|r| r.value.clone())
    }

    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.inner
            .lock()
            .unwrap()
            .records
            .get(key)
            .filter(|r| r.is_live(now))
            .map(|r| r.expires_at - now)
    }

    pub fn live_keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .inner
            .lock()
            .unwrap()
            .records
            .iter()
            .filter(|(_, r)| r.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, op: MockOp) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .count()
    }

    async fn enter(&self, op: MockOp, key: &str, ttl: Option<Duration>) -> Result<(), MockStoreError> {
        let (latency, failing) = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(StoreCall {
                op,
                key: key.to_string(),
                ttl,
            });
            (inner.latency, inner.failing.contains(&op))
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if failing {
            return Err(MockStoreError("injected store failure"));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct MockStoreError(pub &'static str);

impl std::fmt::Display for MockStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for MockStoreError {}

impl ClaimStore for MemoryClaimStore {
    type Error = MockStoreError;

    async fn set_if_absent(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool, MockStoreError> {
        self.enter(MockOp::SetIfAbsent, key, Some(ttl)).await?;
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        if inner.records.get(key).is_some_and(|r| r.is_live(now)) {
            return Ok(false);
        }
        inner.records.insert(
            key.to_string(),
            Record {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool, MockStoreError> {
        self.enter(MockOp::Set, key, Some(ttl)).await?;
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        match inner.records.get_mut(key) {
            Some(record) if record.is_live(now) => {
                record.value = value;
                record.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<u64, MockStoreError> {
        self.enter(MockOp::Delete, key, None).await?;
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        match inner.records.remove(key) {
            Some(record) if record.is_live(now) => Ok(1),
            _ => Ok(0),
        }
    }
}
