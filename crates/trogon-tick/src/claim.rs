//! Tick claims in the shared store.
//!
//! Key space (default prefix `cron.`):
//!
//! | Key | Holds | Lifetime |
//! |-----|-------|----------|
//! | `{prefix}owner.{name}` | current owner of the job | lease TTL, renewed while the body runs |
//! | `{prefix}tick.{unix}.{name}` | proof that tick `unix` was claimed | one period plus lease TTL |
//!
//! The `owner.` and `tick.` namespaces never overlap, so no job name can
//! collide with another job's tick key.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    config::{EngineConfig, StoreFailure},
    error::{StoreError, StoreOp},
    job::JobSpec,
    schedule,
    traits::ClaimStore,
};

/// How claims are laid out in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimLayout {
    /// Per-tick key first, then a short-lived owner key renewed during the
    /// run. Release deletes the owner key; the per-tick key alone keeps the
    /// same tick from being claimed twice.
    #[default]
    PerTick,
    /// Owner key only, alive for one period plus the lease TTL. Release
    /// shortens it to expire at the next tick instead of deleting it.
    SingleOwner,
}

impl fmt::Display for ClaimLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PerTick => f.write_str("per_tick"),
            Self::SingleOwner => f.write_str("single_owner"),
        }
    }
}

impl FromStr for ClaimLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "per_tick" => Ok(Self::PerTick),
            "single_owner" => Ok(Self::SingleOwner),
            other => Err(format!("unknown claim layout '{other}' (expected per_tick or single_owner)")),
        }
    }
}

pub fn owner_key(prefix: &str, name: &str) -> String {
    format!("{prefix}owner.{name}")
}

pub fn tick_key(prefix: &str, name: &str, tick: i64) -> String {
    format!("{prefix}tick.{tick}.{name}")
}

/// Value stored under every claim key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub tick: DateTime<Utc>,
    pub tick_unix: i64,
    pub name: String,
    pub repeat_sec: i64,
    pub offset_sec: i64,
    pub node_id: Uuid,
    pub execution_id: Uuid,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl ClaimRecord {
    pub fn new(job: &JobSpec, tick: i64, node_id: Uuid, execution_id: Uuid) -> Self {
        Self {
            tick: DateTime::from_timestamp(tick, 0).unwrap_or_default(),
            tick_unix: tick,
            name: job.name.clone(),
            repeat_sec: job.repeat_sec,
            offset_sec: job.offset_sec,
            node_id,
            execution_id,
            tags: job.tags.clone(),
            sequence: job.sequence,
        }
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// True once the successor of the recorded tick is due, i.e. the record
    /// no longer describes a tick anyone may legitimately be running. Meant
    /// for tools reading records straight out of the store.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.tick_unix.saturating_add(self.repeat_sec)
    }
}

/// A won claim. Carries everything renewal and release need.
#[derive(Debug, Clone)]
pub struct Claim {
    pub tick: i64,
    pub execution_id: Uuid,
    pub owner_key: String,
    value: Bytes,
}

/// The claim / renew / release handshake for one engine.
///
/// Every store call is bounded by `op_timeout`. A failed or timed-out call is
/// reported to the error sink and then treated as if it never happened.
pub struct ClaimProtocol<S, C> {
    store: S,
    clock: C,
    config: Arc<EngineConfig>,
    node_id: Uuid,
}

impl<S: Clone, C: Clone> Clone for ClaimProtocol<S, C> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            config: Arc::clone(&self.config),
            node_id: self.node_id,
        }
    }
}

impl<S: ClaimStore, C: Clock> ClaimProtocol<S, C> {
    pub fn new(store: S, clock: C, config: Arc<EngineConfig>, node_id: Uuid) -> Self {
        Self {
            store,
            clock,
            config,
            node_id,
        }
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn owner_key(&self, job: &JobSpec) -> String {
        owner_key(&self.config.key_prefix, &job.name)
    }

    pub fn tick_key(&self, job: &JobSpec, tick: i64) -> String {
        tick_key(&self.config.key_prefix, &job.name, tick)
    }

    fn period(job: &JobSpec) -> Duration {
        Duration::from_secs(job.repeat_sec.unsigned_abs())
    }

    fn owner_ttl(&self, job: &JobSpec) -> Duration {
        match self.config.layout {
            ClaimLayout::PerTick => self.config.lease_ttl,
            ClaimLayout::SingleOwner => Self::period(job) + self.config.lease_ttl,
        }
    }

    /// Try to become the only executor of `tick`. `Some` iff this call
    /// created the claim.
    pub async fn try_claim(&self, job: &JobSpec, tick: i64) -> Option<Claim> {
        let execution_id = Uuid::new_v4();
        let value = match ClaimRecord::new(job, tick, self.node_id, execution_id).encode() {
            Ok(v) => v,
            Err(e) => {
                warn!(job = %job.name, tick, error = %e, "Failed to encode claim record");
                return None;
            }
        };
        let owner_key = self.owner_key(job);

        if self.config.layout == ClaimLayout::PerTick {
            let tick_key = self.tick_key(job, tick);
            let ttl = Self::period(job) + self.config.lease_ttl;
            let won = self
                .call(job, StoreOp::Claim, &tick_key, self.store.set_if_absent(&tick_key, value.clone(), ttl))
                .await?;
            if !won {
                debug!(job = %job.name, tick, "Tick already claimed elsewhere");
                return None;
            }
        }

        let won = self
            .call(
                job,
                StoreOp::Claim,
                &owner_key,
                self.store.set_if_absent(&owner_key, value.clone(), self.owner_ttl(job)),
            )
            .await?;
        if !won {
            // Under PerTick the tick key stays behind and expires on its own,
            // so this tick is not retried.
            debug!(job = %job.name, tick, "Owner record held by a previous execution, skipping tick");
            return None;
        }

        info!(job = %job.name, tick, node_id = %self.node_id, %execution_id, "Claimed tick");
        Some(Claim {
            tick,
            execution_id,
            owner_key,
            value,
        })
    }

    /// Push the owner record's expiry forward. `false` means ownership can no
    /// longer be proven and the execution must stop.
    pub async fn renew(&self, job: &JobSpec, claim: &Claim) -> bool {
        let renewed = self
            .call(
                job,
                StoreOp::Renew,
                &claim.owner_key,
                self.store.set(&claim.owner_key, claim.value.clone(), self.owner_ttl(job)),
            )
            .await;
        match renewed {
            Some(true) => {
                debug!(job = %job.name, tick = claim.tick, "Renewed owner record");
                true
            }
            Some(false) => {
                self.report(
                    job,
                    StoreError::ClaimMissing {
                        operation: StoreOp::Renew,
                        key: claim.owner_key.clone(),
                    },
                );
                false
            }
            None => false,
        }
    }

    /// Give the owner record up after the body returned. Failure is reported
    /// but harmless: the record still expires on its TTL.
    pub async fn release(&self, job: &JobSpec, claim: &Claim) -> bool {
        if self.config.layout == ClaimLayout::SingleOwner {
            let now_ms = self.clock.now().timestamp_millis();
            let remaining = schedule::millis_until_next_tick(claim.tick, job.repeat_sec, now_ms);
            if remaining > 0 {
                let ttl = Duration::from_millis(remaining.unsigned_abs());
                let shortened = self
                    .call(
                        job,
                        StoreOp::Release,
                        &claim.owner_key,
                        self.store.set(&claim.owner_key, claim.value.clone(), ttl),
                    )
                    .await;
                return match shortened {
                    Some(true) => {
                        debug!(job = %job.name, tick = claim.tick, ttl_ms = remaining, "Owner record expires at next tick");
                        true
                    }
                    Some(false) => {
                        debug!(job = %job.name, tick = claim.tick, "Owner record already gone at release");
                        false
                    }
                    None => false,
                };
            }
        }

        match self
            .call(job, StoreOp::Release, &claim.owner_key, self.store.delete(&claim.owner_key))
            .await
        {
            Some(0) => {
                debug!(job = %job.name, tick = claim.tick, "Owner record already gone at release");
                false
            }
            Some(_) => {
                debug!(job = %job.name, tick = claim.tick, "Released owner record");
                true
            }
            None => false,
        }
    }

    async fn call<T, F>(&self, job: &JobSpec, operation: StoreOp, key: &str, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T, S::Error>>,
    {
        match tokio::time::timeout(self.config.op_timeout, fut).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.report(
                    job,
                    StoreError::Backend {
                        operation,
                        key: key.to_string(),
                        source: Box::new(e),
                    },
                );
                None
            }
            Err(_) => {
                self.report(
                    job,
                    StoreError::Timeout {
                        operation,
                        key: key.to_string(),
                        after: self.config.op_timeout,
                    },
                );
                None
            }
        }
    }

    fn report(&self, job: &JobSpec, error: StoreError) {
        warn!(job = %job.name, key = %error.key(), error = %error, "Store operation failed");
        self.config.report(&StoreFailure {
            job: job.identity(),
            error,
        });
    }
}
