//! Error types for trogon-tick.
//!
//! Only [`RegisterError`] and [`ConfigError`] ever reach a caller as `Err`.
//! [`StoreError`] is never propagated out of the claim loop: it is delivered
//! to the configured error sink and logged, then treated as "claim not
//! obtained".

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::engine::EngineState;

/// Which claim-protocol step a store call belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Claim,
    Renew,
    Release,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Claim => "claim",
            Self::Renew => "renew",
            Self::Release => "release",
        };
        f.write_str(s)
    }
}

/// Rejected job registration. Raised synchronously, before any loop starts.
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("job name must be non-empty")]
    EmptyName,

    #[error("job '{name}': repeat_sec must be greater than zero, got {repeat_sec}")]
    InvalidRepeat { name: String, repeat_sec: i64 },

    #[error("job '{name}' is already registered")]
    Duplicate { name: String },

    #[error("engine is {state} and no longer accepts jobs")]
    NotRunning { state: EngineState },
}

/// A failed or inconclusive store call.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store {operation} on '{key}' timed out after {after:?}")]
    Timeout {
        operation: StoreOp,
        key: String,
        after: Duration,
    },

    #[error("store {operation} on '{key}' failed: {source}")]
    Backend {
        operation: StoreOp,
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The record was evicted, expired or replaced while we still held it.
    #[error("claim record '{key}' disappeared during {operation}")]
    ClaimMissing { operation: StoreOp, key: String },
}

impl StoreError {
    pub fn operation(&self) -> StoreOp {
        match self {
            Self::Timeout { operation, .. }
            | Self::Backend { operation, .. }
            | Self::ClaimMissing { operation, .. } => *operation,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Timeout { key, .. } | Self::Backend { key, .. } | Self::ClaimMissing { key, .. } => {
                key
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    InvalidEnv { var: &'static str, reason: String },

    #[error("invalid engine config: {0}")]
    Invalid(String),
}

/// Errors raised by the NATS KV backed store.
#[derive(Debug, Error)]
pub enum NatsStoreError {
    #[error("KV error: {0}")]
    Kv(String),
}
