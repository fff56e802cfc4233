//! # trogon-tick
//!
//! Distributed periodic jobs with at-most-once execution per tick.
//!
//! Every process registers the same jobs. Each process samples the wall
//! clock on its own jittered cadence and, when a sample lands on a due tick,
//! races the others for a claim in a shared store. The winner runs the job
//! body while a background renewer keeps the claim alive; the losers do
//! nothing.
//!
//! ## Features
//!
//! - Ticks are unix seconds `t` with `(t - offset_sec) mod repeat_sec == 0`.
//! - Claims live in NATS KV (`cron_claims` bucket) or any [`ClaimStore`].
//! - A claim that cannot be renewed cancels the running body.
//! - Store outages skip ticks; skipped ticks are never replayed.
//! - Drain-based shutdown with a grace period.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use async_nats::jetstream;
//! use trogon_tick::{CronEngine, EngineConfig, JobSpec, NatsClaimStore, TickContext};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let nats = async_nats::connect("nats://localhost:4222").await?;
//!     let js = jetstream::new(nats);
//!     let bucket = trogon_tick::kv::get_or_create_claim_bucket(
//!         &js,
//!         trogon_tick::kv::CLAIM_BUCKET,
//!         trogon_tick::kv::CLAIM_BUCKET_MAX_AGE,
//!     )
//!     .await?;
//!
//!     let engine = CronEngine::new(NatsClaimStore::new(bucket), EngineConfig::default())?;
//!     engine.register(JobSpec::new("heartbeat", 60, 0), |ctx: TickContext| async move {
//!         tracing::info!(tick = ctx.tick_unix(), "beat");
//!     })?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     engine.stop(Duration::from_secs(30)).await;
//!     Ok(())
//! }
//! ```

pub mod claim;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
mod executor;
pub mod job;
pub mod kv;
pub mod nats_impls;
pub mod sampler;
pub mod schedule;
pub mod traits;

#[cfg(any(test, feature = "test-support"))]
pub mod mocks;

pub use claim::{ClaimLayout, ClaimRecord};
pub use clock::{Clock, SystemClock};
pub use config::{EngineConfig, ErrorSink, ReadEnv, StoreFailure, SystemEnv};
pub use engine::{CronEngine, EngineState, JobHandle};
pub use error::{ConfigError, NatsStoreError, RegisterError, StoreError, StoreOp};
pub use job::{JobBody, JobIdentity, JobSpec, JobStats, TickContext};
pub use nats_impls::NatsClaimStore;
pub use traits::ClaimStore;
