use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::{error::RegisterError, schedule};

/// A periodic job: fires at every unix second `t` with
/// `(t - offset_sec) mod repeat_sec == 0`.
///
/// Immutable once registered; the engine keeps it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub repeat_sec: i64,
    /// Used only modulo `repeat_sec`; may be negative or exceed the period.
    #[serde(default)]
    pub offset_sec: i64,
    /// Opaque labels attached to every error report for this job.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, repeat_sec: i64, offset_sec: i64) -> Self {
        Self {
            name: name.into(),
            repeat_sec,
            offset_sec,
            tags: Vec::new(),
            sequence: None,
        }
    }

    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn validate(&self) -> Result<(), RegisterError> {
        if self.name.is_empty() {
            return Err(RegisterError::EmptyName);
        }
        if self.repeat_sec <= 0 {
            return Err(RegisterError::InvalidRepeat {
                name: self.name.clone(),
                repeat_sec: self.repeat_sec,
            });
        }
        Ok(())
    }

    #[inline]
    pub fn is_due(&self, t: i64) -> bool {
        schedule::is_due(t, self.repeat_sec, self.offset_sec)
    }

    pub fn identity(&self) -> JobIdentity {
        JobIdentity {
            name: self.name.clone(),
            tags: self.tags.clone(),
            sequence: self.sequence,
        }
    }
}

/// What an error report says about the job it concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobIdentity {
    pub name: String,
    pub tags: Vec<String>,
    pub sequence: Option<u64>,
}

/// The work run once per claimed tick.
///
/// Implemented for every `Fn(TickContext) -> impl Future<Output = ()>`
/// closure. The body should watch [`TickContext::cancelled`] and return
/// promptly once it fires; the engine never aborts a body forcibly. Errors
/// and panics inside the body are the body's own business.
pub trait JobBody: Send + Sync + 'static {
    fn run(&self, ctx: TickContext) -> impl Future<Output = ()> + Send;
}

impl<F, Fut> JobBody for F
where
    F: Fn(TickContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    fn run(&self, ctx: TickContext) -> impl Future<Output = ()> + Send {
        self(ctx)
    }
}

/// Handed to the job body for one claimed tick.
#[derive(Debug, Clone)]
pub struct TickContext {
    job: Arc<JobSpec>,
    tick: i64,
    execution_id: Uuid,
    scope: CancellationToken,
}

impl TickContext {
    pub(crate) fn new(job: Arc<JobSpec>, tick: i64, execution_id: Uuid, scope: CancellationToken) -> Self {
        Self {
            job,
            tick,
            execution_id,
            scope,
        }
    }

    pub fn job(&self) -> &JobSpec {
        &self.job
    }

    pub fn job_name(&self) -> &str {
        &self.job.name
    }

    /// The tick being honoured, in unix seconds.
    pub fn tick_unix(&self) -> i64 {
        self.tick
    }

    pub fn tick(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.tick, 0).unwrap_or_default()
    }

    /// Unique per claim; also stored in the claim record.
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.scope
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Resolves when ownership is lost or the engine is forced to stop.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.scope.cancelled()
    }
}

/// Point-in-time counters for one registered job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStats {
    /// Samples that landed on a due tick (several samples may hit one tick).
    pub due_samples: u64,
    pub claims_won: u64,
    /// Claim attempts that did not win, including store failures.
    pub claims_lost: u64,
    /// Bodies that ran to completion or returned after cancellation.
    pub executions: u64,
    pub ownership_lost: u64,
}

#[derive(Debug, Default)]
pub(crate) struct JobCounters {
    due_samples: AtomicU64,
    claims_won: AtomicU64,
    claims_lost: AtomicU64,
    executions: AtomicU64,
    ownership_lost: AtomicU64,
    executing: AtomicBool,
}

impl JobCounters {
    pub(crate) fn due(&self) {
        self.due_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn claim(&self, won: bool) {
        if won {
            self.claims_won.fetch_add(1, Ordering::Relaxed);
        } else {
            self.claims_lost.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn executed(&self, lost_ownership: bool) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        if lost_ownership {
            self.ownership_lost.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn set_executing(&self, executing: bool) {
        self.executing.store(executing, Ordering::SeqCst);
    }

    pub(crate) fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    pub(crate) fn snapshot(&self) -> JobStats {
        JobStats {
            due_samples: self.due_samples.load(Ordering::Relaxed),
            claims_won: self.claims_won.load(Ordering::Relaxed),
            claims_lost: self.claims_lost.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
            ownership_lost: self.ownership_lost.load(Ordering::Relaxed),
        }
    }
}
