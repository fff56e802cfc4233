use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    claim::{Claim, ClaimProtocol},
    clock::Clock,
    job::{JobBody, JobSpec, TickContext},
    traits::ClaimStore,
};

/// Run the body for a won claim, keeping the claim alive while it runs.
///
/// Order of events:
/// 1. a scope token is derived from `root` and a renewer task is started;
/// 2. the body runs with that scope;
/// 3. the scope is cancelled and the renewer is awaited;
/// 4. the owner record is released.
///
/// If a renewal fails the renewer cancels the scope first, so the body is
/// told to stop before anything is cleaned up. If the body panics the drop
/// guard cancels the scope and the renewer winds down; the owner record then
/// expires on its TTL.
///
/// Returns `true` when ownership was lost during the run.
pub(crate) async fn supervise<S, C, B>(
    protocol: &ClaimProtocol<S, C>,
    job: Arc<JobSpec>,
    body: &B,
    claim: Claim,
    root: &CancellationToken,
    renew_interval: Duration,
) -> bool
where
    S: ClaimStore,
    C: Clock,
    B: JobBody,
{
    let scope = root.child_token();
    let _guard = scope.clone().drop_guard();

    let renewer = tokio::spawn(renew_until_cancelled(
        protocol.clone(),
        Arc::clone(&job),
        claim.clone(),
        scope.clone(),
        renew_interval,
    ));

    tracing::debug!(job = %job.name, tick = claim.tick, execution_id = %claim.execution_id, "Running job body");
    body.run(TickContext::new(
        Arc::clone(&job),
        claim.tick,
        claim.execution_id,
        scope.clone(),
    ))
    .await;

    scope.cancel();
    let lost = match renewer.await {
        Ok(lost) => lost,
        Err(e) => {
            tracing::error!(job = %job.name, tick = claim.tick, error = %e, "Lease renewer task failed");
            true
        }
    };

    protocol.release(&job, &claim).await;

    if lost {
        tracing::warn!(job = %job.name, tick = claim.tick, "Execution finished after losing ownership");
    } else {
        tracing::debug!(job = %job.name, tick = claim.tick, "Execution finished");
    }
    lost
}

/// Renew every `every` until `scope` is cancelled. Returns `true` if a
/// renewal failed, after cancelling `scope`.
async fn renew_until_cancelled<S, C>(
    protocol: ClaimProtocol<S, C>,
    job: Arc<JobSpec>,
    claim: Claim,
    scope: CancellationToken,
    every: Duration,
) -> bool
where
    S: ClaimStore,
    C: Clock,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = scope.cancelled() => return false,
            _ = ticker.tick() => {
                if protocol.renew(&job, &claim).await {
                    continue;
                }
                // The body finished while the renewal was in flight.
                if scope.is_cancelled() {
                    return false;
                }
                tracing::warn!(job = %job.name, tick = claim.tick, "Lost ownership, cancelling execution");
                scope.cancel();
                return true;
            }
        }
    }
}
