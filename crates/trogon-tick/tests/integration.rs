//! Integration tests: require a running NATS server with JetStream.
//!
//! Run with:
//!   NATS_TEST_URL=nats://localhost:4222 cargo test -p trogon-tick --test integration -- --include-ignored
//!
//! Every test works in its own freshly created bucket, so they can run in
//! parallel. These tests are marked `#[ignore]` so they don't run in CI
//! without NATS.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_nats::jetstream::{self, kv};
use bytes::Bytes;
use trogon_tick::{ClaimRecord, ClaimStore, CronEngine, EngineConfig, JobSpec, NatsClaimStore, TickContext};

fn test_url() -> String {
    std::env::var("NATS_TEST_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string())
}

async fn connect_js() -> jetstream::Context {
    let nats = async_nats::connect(test_url())
        .await
        .expect("Failed to connect to NATS, is NATS_TEST_URL set and NATS running?");
    jetstream::new(nats)
}

fn unique_bucket(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

async fn claim_store(js: &jetstream::Context, bucket: &str) -> (NatsClaimStore, kv::Store) {
    let kv = trogon_tick::kv::get_or_create_claim_bucket(js, bucket, Duration::from_secs(600))
        .await
        .expect("Failed to create claim bucket");
    (NatsClaimStore::new(kv.clone()), kv)
}

async fn drop_bucket(js: &jetstream::Context, bucket: &str) {
    let _ = js.delete_key_value(bucket).await;
}

#[tokio::test]
#[ignore = "requires NATS at NATS_TEST_URL"]
async fn test_set_if_absent_has_one_winner() {
    let js = connect_js().await;
    let bucket = unique_bucket("tick_absent");
    let (store, _) = claim_store(&js, &bucket).await;
    let other = store.clone();

    let first = store
        .set_if_absent("cron.owner.heartbeat", Bytes::from_static(b"a"), Duration::from_secs(30))
        .await
        .unwrap();
    let second = other
        .set_if_absent("cron.owner.heartbeat", Bytes::from_static(b"b"), Duration::from_secs(30))
        .await
        .unwrap();

    assert!(first);
    assert!(!second);
    drop_bucket(&js, &bucket).await;
}

#[tokio::test]
#[ignore = "requires NATS at NATS_TEST_URL"]
async fn test_concurrent_claims_have_one_winner() {
    let js = connect_js().await;
    let bucket = unique_bucket("tick_race");
    let (store, _) = claim_store(&js, &bucket).await;

    let attempts = (0..10).map(|i| {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .set_if_absent("cron.tick.1800000000.race", Bytes::from(format!("{i}")), Duration::from_secs(30))
                .await
                .unwrap()
        })
    });
    let results = futures::future::join_all(attempts).await;

    let winners = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
    assert_eq!(winners, 1);
    drop_bucket(&js, &bucket).await;
}

#[tokio::test]
#[ignore = "requires NATS at NATS_TEST_URL"]
async fn test_expired_record_can_be_claimed_again() {
    let js = connect_js().await;
    let bucket = unique_bucket("tick_expiry");
    let (store, _) = claim_store(&js, &bucket).await;
    let key = "cron.owner.short";

    assert!(store.set_if_absent(key, Bytes::new(), Duration::from_millis(300)).await.unwrap());
    assert!(!store.set_if_absent(key, Bytes::new(), Duration::from_secs(30)).await.unwrap());

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(!store.set(key, Bytes::new(), Duration::from_secs(30)).await.unwrap(), "set must not revive it");
    assert!(store.set_if_absent(key, Bytes::new(), Duration::from_secs(30)).await.unwrap());
    drop_bucket(&js, &bucket).await;
}

#[tokio::test]
#[ignore = "requires NATS at NATS_TEST_URL"]
async fn test_set_extends_live_record() {
    let js = connect_js().await;
    let bucket = unique_bucket("tick_renew");
    let (store, _) = claim_store(&js, &bucket).await;
    let key = "cron.owner.renewed";

    store.set_if_absent(key, Bytes::new(), Duration::from_millis(600)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(store.set(key, Bytes::new(), Duration::from_millis(600)).await.unwrap());
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(!store.set_if_absent(key, Bytes::new(), Duration::from_secs(30)).await.unwrap());
    drop_bucket(&js, &bucket).await;
}

#[tokio::test]
#[ignore = "requires NATS at NATS_TEST_URL"]
async fn test_delete_counts_live_records() {
    let js = connect_js().await;
    let bucket = unique_bucket("tick_delete");
    let (store, _) = claim_store(&js, &bucket).await;
    let key = "cron.owner.gone";

    assert_eq!(store.delete(key).await.unwrap(), 0);
    store.set_if_absent(key, Bytes::new(), Duration::from_secs(30)).await.unwrap();
    assert_eq!(store.delete(key).await.unwrap(), 1);
    assert_eq!(store.delete(key).await.unwrap(), 0);
    assert!(store.set_if_absent(key, Bytes::new(), Duration::from_secs(30)).await.unwrap());
    drop_bucket(&js, &bucket).await;
}

#[tokio::test]
#[ignore = "requires NATS at NATS_TEST_URL"]
async fn test_job_names_outside_key_alphabet() {
    let js = connect_js().await;
    let bucket = unique_bucket("tick_escape");
    let (store, raw) = claim_store(&js, &bucket).await;

    assert!(store.set_if_absent("cron.owner.nightly report*", Bytes::new(), Duration::from_secs(30)).await.unwrap());
    assert!(store.set_if_absent("cron.owner.nightly report>", Bytes::new(), Duration::from_secs(30)).await.unwrap());

    let entry = raw.entry("cron.owner.nightly=20report=2A").await.unwrap();
    assert!(entry.is_some());
    drop_bucket(&js, &bucket).await;
}

#[tokio::test]
#[ignore = "requires NATS at NATS_TEST_URL"]
async fn test_engines_sharing_a_bucket_run_each_tick_once() {
    let js = connect_js().await;
    let bucket = unique_bucket("tick_engines");
    let (store, raw) = claim_store(&js, &bucket).await;
    let runs: Arc<Mutex<Vec<(i64, uuid::Uuid)>>> = Arc::new(Mutex::new(Vec::new()));

    let mut engines = Vec::new();
    for _ in 0..3 {
        let engine = CronEngine::new(store.clone(), EngineConfig::default().with_lease_ttl(Duration::from_secs(10)))
            .unwrap();
        let log = Arc::clone(&runs);
        engine
            .register(JobSpec::new("pulse", 2, 0), move |ctx: TickContext| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push((ctx.tick_unix(), ctx.execution_id()));
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
            })
            .unwrap();
        engines.push(engine);
    }

    tokio::time::sleep(Duration::from_secs(7)).await;
    for engine in &engines {
        engine.stop(Duration::from_secs(5)).await;
    }

    let runs = runs.lock().unwrap().clone();
    let mut ticks: Vec<i64> = runs.iter().map(|(t, _)| *t).collect();
    ticks.sort();
    let before = ticks.len();
    ticks.dedup();
    assert!(before >= 2, "expected at least two ticks in 7s, got {before}");
    assert_eq!(ticks.len(), before, "a tick ran more than once: {runs:?}");
    assert!(ticks.iter().all(|t| t % 2 == 0));

    let (last_tick, last_execution) = *runs.last().unwrap();
    let entry = raw
        .entry(format!("cron.tick.{last_tick}.pulse"))
        .await
        .unwrap()
        .expect("per-tick record missing");
    let (_, payload) = trogon_tick::nats_impls::open(&entry.value).unwrap();
    let record = ClaimRecord::decode(payload).unwrap();
    assert_eq!(record.tick_unix, last_tick);
    assert_eq!(record.execution_id, last_execution);
    drop_bucket(&js, &bucket).await;
}
