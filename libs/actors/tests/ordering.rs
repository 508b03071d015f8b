//! Mailbox ordering, serializability and backpressure

mod common;

use common::{system, system_with, Counter, Gate, Recorder};
use messaging_actors::{
    Message, OverflowContext, OverflowHandler, OverflowPolicy, RuntimeConfig, SpawnOptions,
};
use proptest::prelude::*;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_producer_fifo() {
    let system = system();
    let recorder = Arc::new(Recorder::default());
    let counter = system
        .spawn("counter", Counter::new().with_recorder(recorder.clone()))
        .await
        .unwrap();

    for i in 0..500 {
        counter.send("record", vec![json!(i)]).await.unwrap();
    }
    counter.query("get", vec![]).await.unwrap();

    assert_eq!(*recorder.seen.lock(), (0..500).collect::<Vec<_>>());
    assert!(!recorder.overlapped.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_never_overlap() {
    let system = system();
    let recorder = Arc::new(Recorder::default());
    let counter = system
        .spawn("counter", Counter::new().with_recorder(recorder.clone()))
        .await
        .unwrap();

    let producers: Vec<_> = (0..8i64)
        .map(|p| {
            let counter = counter.clone();
            tokio::spawn(async move {
                for i in 0..100 {
                    counter.send("record", vec![json!(p * 1000 + i)]).await.unwrap();
                }
            })
        })
        .collect();
    for producer in futures::future::join_all(producers).await {
        producer.unwrap();
    }
    counter.query("get", vec![]).await.unwrap();

    let seen = recorder.seen.lock().clone();
    assert_eq!(seen.len(), 800);
    assert!(!recorder.overlapped.load(Ordering::SeqCst));
    for p in 0..8 {
        let mine: Vec<_> = seen.iter().filter(|v| **v / 1000 == p).copied().collect();
        assert_eq!(mine, (0..100).map(|i| p * 1000 + i).collect::<Vec<_>>());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_actors_run_in_parallel() {
    let system = system();
    let mut refs = Vec::new();
    for n in 0..16 {
        refs.push(system.spawn(format!("counter-{}", n), Counter::new()).await.unwrap());
    }

    let calls = refs.iter().map(|r| async move {
        for _ in 0..50 {
            r.send("add", vec![json!(1)]).await.unwrap();
        }
        r.query("get", vec![]).await.unwrap()
    });
    for value in futures::future::join_all(calls).await {
        assert_eq!(value, json!(50));
    }
}

#[tokio::test]
async fn test_zero_timeout_offer_when_full() {
    let system = system();
    let gate = Arc::new(Gate::default());
    let counter = system
        .spawn_with(
            "counter",
            Counter::new().with_gate(gate.clone()),
            SpawnOptions::new().capacity(2),
        )
        .await
        .unwrap();

    counter.send("block", vec![]).await.unwrap();
    gate.entered.notified().await;

    let address = counter.address().clone();
    let add = |n: i64| Message::send(address.clone(), "add", vec![json!(n)]);
    assert!(counter.offer(add(1), Duration::ZERO).await);
    assert!(counter.offer(add(2), Duration::ZERO).await);
    assert_eq!(counter.size(), 2);

    assert!(!counter.offer(add(100), Duration::ZERO).await);
    assert_eq!(counter.size(), 2);
    assert_eq!(counter.metrics().snapshot().overflow_events, 1);

    gate.release.notify_one();
    assert_eq!(counter.query("get", vec![]).await.unwrap(), json!(3));

    assert!(counter.offer(add(4), Duration::ZERO).await);
    assert_eq!(counter.query("get", vec![]).await.unwrap(), json!(7));
}

struct DropAll;

impl OverflowHandler for DropAll {
    fn on_overflow(&self, _message: &Message, _context: &OverflowContext) -> OverflowPolicy {
        OverflowPolicy::Drop
    }
}

#[tokio::test]
async fn test_drop_policy_fails_queries_with_queue_full() {
    let system = system();
    let gate = Arc::new(Gate::default());
    let counter = system
        .spawn_with(
            "counter",
            Counter::new().with_gate(gate.clone()),
            SpawnOptions::new().capacity(1).overflow(Arc::new(DropAll)),
        )
        .await
        .unwrap();

    counter.send("block", vec![]).await.unwrap();
    gate.entered.notified().await;
    counter.send("add", vec![json!(1)]).await.unwrap();

    // Dropped, but the offer still counts as consumed.
    let dropped = Message::send(counter.address().clone(), "add", vec![json!(10)]);
    assert!(counter.offer(dropped, Duration::ZERO).await);

    let (reply, pending) = system.queries().register_query("test", None);
    let query = Message::query(counter.address().clone(), "get", vec![], reply);
    assert!(counter.offer(query, Duration::ZERO).await);
    let err = pending.await.unwrap_err();
    assert!(matches!(err, messaging_actors::ActorError::QueueFull { .. }));

    gate.release.notify_one();
    assert_eq!(counter.query("get", vec![]).await.unwrap(), json!(1));
}

#[tokio::test]
async fn test_offer_to_wrong_mailbox_is_refused() {
    let system = system();
    let counter = system.spawn("counter", Counter::new()).await.unwrap();

    let (reply, pending) = system.queries().register_query("test", None);
    let stray = Message::query("elsewhere".into(), "get", vec![], reply);
    assert!(!counter.offer(stray, Duration::ZERO).await);

    let err = pending.await.unwrap_err();
    assert!(matches!(err, messaging_actors::ActorError::IllegalState { .. }));
    assert!(err.to_string().contains("elsewhere"));
    assert!(counter.is_empty());
}

#[tokio::test]
async fn test_send_timeout_is_capped_by_config() {
    let mut config = RuntimeConfig::default();
    config.mailbox.capacity = 1;
    config.mailbox.send_timeout_ms = 50;
    let system = system_with(config);
    let gate = Arc::new(Gate::default());
    let counter = system
        .spawn("counter", Counter::new().with_gate(gate.clone()))
        .await
        .unwrap();

    counter.send("block", vec![]).await.unwrap();
    gate.entered.notified().await;
    counter.send("add", vec![json!(1)]).await.unwrap();

    let started = std::time::Instant::now();
    let message = Message::send(counter.address().clone(), "add", vec![json!(1)]);
    assert!(!counter.offer(message, Duration::from_secs(30)).await);
    assert!(started.elapsed() < Duration::from_secs(5));

    gate.release.notify_one();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_mailbox_preserves_submission_order(
        values in proptest::collection::vec(-1000i64..1000, 1..200),
        capacity in 1usize..8,
        batch_limit in 1usize..16,
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();

        let (seen, overlapped) = runtime.block_on(async {
            let mut config = RuntimeConfig::default();
            config.mailbox.batch_limit = batch_limit;
            let system = system_with(config);
            let recorder = Arc::new(Recorder::default());
            let counter = system
                .spawn_with(
                    "counter",
                    Counter::new().with_recorder(recorder.clone()),
                    SpawnOptions::new().capacity(capacity),
                )
                .await
                .unwrap();

            for v in &values {
                counter.send("record", vec![json!(v)]).await.unwrap();
            }
            counter.query("get", vec![]).await.unwrap();
            let seen = recorder.seen.lock().clone();
            (seen, recorder.overlapped.load(Ordering::SeqCst))
        });

        prop_assert_eq!(seen, values);
        prop_assert!(!overlapped);
    }
}
