//! Performance benchmarks for eventrelay
//!
//! Run with: cargo bench
//! Or via justfile: just bench

use criterion::{criterion_group, criterion_main, Criterion};
use eventrelay::store::sqlite::SqliteStore;
use eventrelay::store::Store;
use eventrelay::types::{CloudEvent, PublishInput};
use eventrelay_cron::CronExpression;

fn publish_input(event_type: &str) -> PublishInput {
    PublishInput {
        event_type: event_type.to_string(),
        subject: None,
        data: Some(serde_json::json!({"rate": 7.35, "currency": "USD/CNY"})),
        dataschema: None,
        datacontenttype: None,
        deliver_at: None,
        cron: None,
    }
}

fn bench_cloud_event_serialization(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = rt.block_on(SqliteStore::connect("sqlite::memory:")).unwrap();
    let (event, _) = rt
        .block_on(store.insert_event("org1", "reuters", publish_input("events.market.forex")))
        .unwrap();
    let cloud_event = event.to_cloud_event();

    c.bench_function("CloudEvent serialize", |b| {
        b.iter(|| serde_json::to_vec(&cloud_event).unwrap());
    });

    let bytes = serde_json::to_vec(&cloud_event).unwrap();
    c.bench_function("CloudEvent deserialize", |b| {
        b.iter(|| serde_json::from_slice::<CloudEvent>(&bytes).unwrap());
    });
}

fn bench_cron_parsing(c: &mut Criterion) {
    c.bench_function("CronExpression::parse", |b| {
        b.iter(|| CronExpression::parse("*/5 9-17 * * 1-5").unwrap());
    });

    let expr = CronExpression::parse("*/5 9-17 * * 1-5").unwrap();
    c.bench_function("CronExpression::next_after", |b| {
        b.iter(|| expr.next_after(eventrelay::types::now()));
    });
}

fn bench_sqlite_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("SqliteStore insert_event", |b| {
        b.to_async(&rt).iter(|| async {
            let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
            store
                .insert_event("org1", "reuters", publish_input("events.market.forex"))
                .await
                .unwrap()
        });
    });
}

fn bench_sqlite_publish_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("publish_throughput");
    for count in [10, 100, 1000] {
        group.bench_function(format!("{} events", count), |b| {
            b.to_async(&rt).iter(|| async {
                let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
                for i in 0..count {
                    store
                        .insert_event(
                            "org1",
                            "reuters",
                            publish_input(&format!("events.market.topic{}", i)),
                        )
                        .await
                        .unwrap();
                }
            });
        });
    }
    group.finish();
}

fn bench_claim_pending(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    // claim_pending moves rows out of the pending pool, so each iteration
    // needs its own freshly seeded store rather than a shared one.
    c.bench_function("claim_pending (batch 100)", |b| {
        b.to_async(&rt).iter_batched(
            || {
                rt.block_on(async {
                    let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
                    let subscription = store
                        .subscribe(
                            "org1",
                            eventrelay::types::SubscribeInput {
                                connection_id: "sub1".to_string(),
                                event_type: "events.market.forex".to_string(),
                                publisher: None,
                                filter: None,
                            },
                        )
                        .await
                        .unwrap();
                    for _ in 0..100 {
                        let (event, _) = store
                            .insert_event("org1", "reuters", publish_input("events.market.forex"))
                            .await
                            .unwrap();
                        store
                            .insert_deliveries(event.id, &[subscription.id], None)
                            .await
                            .unwrap();
                    }
                    store
                })
            },
            |store| async move { store.claim_pending(100).await.unwrap() },
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_cloud_event_serialization,
    bench_cron_parsing,
    bench_sqlite_publish,
    bench_sqlite_publish_throughput,
    bench_claim_pending,
);
criterion_main!(benches);
