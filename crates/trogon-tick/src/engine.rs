use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::{
    claim::ClaimProtocol,
    clock::{Clock, SystemClock},
    config::EngineConfig,
    error::{ConfigError, RegisterError},
    executor,
    job::{JobBody, JobCounters, JobSpec, JobStats},
    sampler, schedule,
    traits::ClaimStore,
};

const RUNNING: u8 = 0;
const STOPPING: u8 = 1;
const STOPPED: u8 = 2;

/// Lifecycle of a [`CronEngine`]. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Running,
    /// No new claims; waiting for in-flight executions.
    Stopping,
    Stopped,
}

impl EngineState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            RUNNING => Self::Running,
            STOPPING => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Stopping => f.write_str("stopping"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// A registered job, as seen from outside its claim loop.
#[derive(Debug, Clone)]
pub struct JobHandle {
    spec: Arc<JobSpec>,
    counters: Arc<JobCounters>,
}

impl JobHandle {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn stats(&self) -> JobStats {
        self.counters.snapshot()
    }

    /// True while this process runs the body for a claimed tick.
    pub fn is_executing(&self) -> bool {
        self.counters.is_executing()
    }
}

/// Runs registered jobs so that each tick executes at most once across every
/// engine sharing the same store.
///
/// Cloning is cheap; clones drive the same engine.
pub struct CronEngine<S: ClaimStore, C: Clock = SystemClock> {
    inner: Arc<Inner<S, C>>,
}

impl<S: ClaimStore, C: Clock> Clone for CronEngine<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<S, C> {
    protocol: ClaimProtocol<S, C>,
    clock: C,
    config: Arc<EngineConfig>,
    /// Cancelled only when in-flight bodies must stop.
    root: CancellationToken,
    /// Child of `root`; cancelled first so loops stop claiming.
    draining: CancellationToken,
    state: AtomicU8,
    jobs: Mutex<HashMap<String, JobHandle>>,
    tracker: TaskTracker,
    node_id: Uuid,
    in_flight: AtomicUsize,
}

impl<S, C> Inner<S, C> {
    fn jobs(&self) -> MutexGuard<'_, HashMap<String, JobHandle>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

impl<S: ClaimStore> CronEngine<S, SystemClock> {
    pub fn new(store: S, config: EngineConfig) -> Result<Self, ConfigError> {
        Self::with_clock(store, SystemClock, config)
    }
}

impl<S: ClaimStore, C: Clock> CronEngine<S, C> {
    pub fn with_clock(store: S, clock: C, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        let node_id = Uuid::new_v4();
        let root = CancellationToken::new();
        let draining = root.child_token();

        tracing::info!(
            %node_id,
            layout = %config.layout,
            key_prefix = %config.key_prefix,
            lease_ttl_ms = config.lease_ttl.as_millis() as u64,
            "Tick engine started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                protocol: ClaimProtocol::new(store, clock.clone(), Arc::clone(&config), node_id),
                clock,
                config,
                root,
                draining,
                state: AtomicU8::new(RUNNING),
                jobs: Mutex::new(HashMap::new()),
                tracker: TaskTracker::new(),
                node_id,
                in_flight: AtomicUsize::new(0),
            }),
        })
    }

    /// Validate `spec` and start its claim loop. Returns without waiting for
    /// any tick. Must be called from within a tokio runtime.
    pub fn register<B: JobBody>(&self, spec: JobSpec, body: B) -> Result<JobHandle, RegisterError> {
        spec.validate()?;

        let handle = {
            let mut jobs = self.inner.jobs();
            let state = self.inner.state();
            if state != EngineState::Running {
                return Err(RegisterError::NotRunning { state });
            }
            if jobs.contains_key(&spec.name) {
                return Err(RegisterError::Duplicate { name: spec.name });
            }
            let handle = JobHandle {
                spec: Arc::new(spec),
                counters: Arc::new(JobCounters::default()),
            };
            jobs.insert(handle.spec.name.clone(), handle.clone());
            handle
        };

        tracing::info!(
            job = %handle.spec.name,
            repeat_sec = handle.spec.repeat_sec,
            offset_sec = handle.spec.offset_sec,
            "Job registered"
        );
        self.inner
            .tracker
            .spawn(claim_loop(Arc::clone(&self.inner), handle.clone(), body));
        Ok(handle)
    }

    /// Stop claiming new ticks and wait for in-flight executions.
    ///
    /// Executions still running after `grace` are cancelled; the call then
    /// keeps waiting until they return. A second call while the first is in
    /// progress only waits for the same drain. The engine cannot be
    /// restarted afterwards.
    pub async fn stop(&self, grace: Duration) {
        let inner = &self.inner;
        let first = {
            let _jobs = inner.jobs();
            inner
                .state
                .compare_exchange(RUNNING, STOPPING, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        };
        if !first {
            inner.tracker.wait().await;
            return;
        }

        tracing::info!(
            in_flight = inner.in_flight.load(Ordering::SeqCst),
            grace_ms = grace.as_millis() as u64,
            "Stopping tick engine"
        );
        inner.draining.cancel();
        inner.tracker.close();

        if tokio::time::timeout(grace, inner.tracker.wait()).await.is_err() {
            tracing::warn!(
                in_flight = inner.in_flight.load(Ordering::SeqCst),
                "Grace period elapsed, cancelling in-flight executions"
            );
            inner.root.cancel();
            inner.tracker.wait().await;
        }

        inner.root.cancel();
        inner.state.store(STOPPED, Ordering::SeqCst);
        tracing::info!(node_id = %inner.node_id, "Tick engine stopped");
    }

    pub fn state(&self) -> EngineState {
        self.inner.state()
    }

    /// Random per-process identity written into every claim record.
    pub fn node_id(&self) -> Uuid {
        self.inner.node_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn job(&self, name: &str) -> Option<JobHandle> {
        self.inner.jobs().get(name).cloned()
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.jobs().keys().cloned().collect();
        names.sort();
        names
    }

    /// Bodies currently running in this process.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }
}

/// Marks a job as executing for as long as it lives.
struct Executing<'a> {
    counters: &'a JobCounters,
    in_flight: &'a AtomicUsize,
}

impl<'a> Executing<'a> {
    fn enter(counters: &'a JobCounters, in_flight: &'a AtomicUsize) -> Self {
        counters.set_executing(true);
        in_flight.fetch_add(1, Ordering::SeqCst);
        Self { counters, in_flight }
    }
}

impl Drop for Executing<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.counters.set_executing(false);
    }
}

async fn claim_loop<S, C, B>(inner: Arc<Inner<S, C>>, handle: JobHandle, body: B)
where
    S: ClaimStore,
    C: Clock,
    B: JobBody,
{
    let job = Arc::clone(&handle.spec);
    let counters = &handle.counters;
    let samples = sampler::samples(
        inner.clock.clone(),
        inner.config.sample_base,
        inner.config.sample_jitter,
        inner.draining.clone(),
    );
    futures::pin_mut!(samples);

    while let Some(now) = samples.next().await {
        let tick = now.timestamp();
        if !job.is_due(tick) {
            continue;
        }
        counters.due();

        let Some(claim) = inner.protocol.try_claim(&job, tick).await else {
            counters.claim(false);
            continue;
        };
        counters.claim(true);

        // Stop was requested while the claim was in flight.
        if inner.draining.is_cancelled() {
            inner.protocol.release(&job, &claim).await;
            tracing::debug!(job = %job.name, tick, "Engine stopping, released claim without running");
            break;
        }

        let _executing = Executing::enter(counters, &inner.in_flight);
        let run = executor::supervise(
            &inner.protocol,
            Arc::clone(&job),
            &body,
            claim,
            &inner.root,
            inner.config.renew_interval,
        );
        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(lost) => counters.executed(lost),
            Err(_) => {
                tracing::error!(job = %job.name, tick, "Job body panicked; owner record left to expire");
                counters.executed(false);
            }
        }
        tracing::debug!(
            job = %job.name,
            next_tick = schedule::next_tick_after(tick, job.repeat_sec, job.offset_sec),
            "Waiting for next tick"
        );
    }

    tracing::debug!(job = %job.name, "Claim loop stopped");
}
