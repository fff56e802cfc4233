use std::env;
use std::str::FromStr;
use std::time::Duration;

use async_nats::jetstream;
use trogon_tick::{CronEngine, EngineConfig, JobSpec, NatsClaimStore, SystemEnv, TickContext, kv};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let nats_url = env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());
    let bucket = env::var("TICK_BUCKET").unwrap_or_else(|_| kv::CLAIM_BUCKET.to_string());
    let job_name = env::var("TICK_JOB_NAME").unwrap_or_else(|_| "heartbeat".to_string());
    let repeat_sec: i64 = env_or_exit("TICK_REPEAT_SEC", 60);
    let offset_sec: i64 = env_or_exit("TICK_OFFSET_SEC", 0);
    let grace = Duration::from_secs(env_or_exit("TICK_SHUTDOWN_GRACE_SEC", 30));

    let config = EngineConfig::from_env(&SystemEnv).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid engine configuration");
        std::process::exit(1);
    });

    tracing::info!(nats_url = %nats_url, "Connecting to NATS");

    let nats = async_nats::connect(&nats_url).await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to connect to NATS");
        std::process::exit(1);
    });

    let period = Duration::from_secs(repeat_sec.max(0).unsigned_abs());
    let max_age = kv::claim_bucket_max_age(period, config.lease_ttl);
    let store = kv::get_or_create_claim_bucket(&jetstream::new(nats), &bucket, max_age)
        .await
        .unwrap_or_else(|e| {
            tracing::error!(bucket = %bucket, error = %e, "Failed to open claim bucket");
            std::process::exit(1);
        });

    let engine = CronEngine::new(NatsClaimStore::new(store), config).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid engine configuration");
        std::process::exit(1);
    });

    let spec = JobSpec::new(job_name, repeat_sec, offset_sec);
    if let Err(e) = engine.register(spec, |ctx: TickContext| async move {
        tracing::info!(
            job = %ctx.job_name(),
            tick = %ctx.tick(),
            execution_id = %ctx.execution_id(),
            "Tick"
        );
    }) {
        tracing::error!(error = %e, "Failed to register job");
        std::process::exit(1);
    }

    shutdown_signal().await;
    tracing::info!(grace_sec = grace.as_secs(), "Shutdown signal received, draining");
    engine.stop(grace).await;
}

fn env_or_exit<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|e| {
            tracing::error!(var = key, value = %raw, error = %e, "Invalid environment variable");
            std::process::exit(1);
        }),
        Err(_) => default,
    }
}

/// Resolves when the process receives a shutdown signal (SIGINT or SIGTERM).
///
/// On non-Unix only Ctrl-C (SIGINT) is available.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = sigterm => {}
    }
}
