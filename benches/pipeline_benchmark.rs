//! Pipeline Benchmarks
//!
//! Measures the hot pure paths of an attempt: identity hashing, batch
//! deduplication, schedule evaluation, and worker pool dispatch.
//! Run with: cargo bench

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

use content_ingestion::dedup::{item_identity, partition_new};
use content_ingestion::pipeline::{AttemptHandler, WorkerPool};
use content_ingestion::schedule::Schedule;
use content_ingestion::schemas::{FetchOutcome, RawItem, Subscription};

fn batch(size: usize, with_ids: bool) -> Vec<RawItem> {
    (0..size)
        .map(|i| {
            let item = RawItem::new(format!("Headline number {i}"))
                .with_url(format!("https://news.example.com/story/{i}?utm_source=rss"))
                .with_published_at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
            if with_ids {
                item.with_external_id(format!("guid-{i}"))
            } else {
                item
            }
        })
        .collect()
}

/// Benchmark identity computation (external id vs. hash fallback)
fn bench_item_identity(c: &mut Criterion) {
    let mut group = c.benchmark_group("item_identity");

    for (label, with_ids) in [("external_id", true), ("hash_fallback", false)] {
        let items = batch(100, with_ids);
        group.throughput(Throughput::Elements(items.len() as u64));
        group.bench_function(label, |b| {
            b.iter(|| {
                for item in &items {
                    black_box(item_identity(item));
                }
            })
        });
    }

    group.finish();
}

/// Benchmark batch dedup with half the batch already stored
fn bench_partition_new(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition_new");

    for size in [50, 500, 5000].iter() {
        let items = batch(*size, true);
        let existing: HashSet<String> = items
            .iter()
            .step_by(2)
            .map(item_identity)
            .collect();

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(format!("batch_{}", size), &items, |b, items| {
            b.iter(|| black_box(partition_new(&existing, items.clone())))
        });
    }

    group.finish();
}

/// Benchmark next-due computation for common schedule shapes
fn bench_schedule_next_after(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule_next_after");
    let reference = Utc.with_ymd_and_hms(2024, 3, 15, 13, 37, 0).unwrap();

    for expr in ["@every 15m", "*/5 * * * *", "30 9 * * 1-5", "0 0 29 2 *"] {
        let schedule = Schedule::parse(expr).unwrap();
        group.bench_function(expr, |b| b.iter(|| black_box(schedule.next_after(reference))));
    }

    group.finish();
}

struct Noop;

#[async_trait]
impl AttemptHandler for Noop {
    async fn process(&self, _subscription: Subscription) -> FetchOutcome {
        tokio::task::yield_now().await;
        FetchOutcome::success(0, 0)
    }
}

/// Benchmark worker pool dispatch with different worker counts
fn bench_worker_scaling(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("worker_scaling");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(5));

    let subscriptions: Vec<Subscription> = (0..1000)
        .map(|id| Subscription {
            id,
            name: format!("s{id}"),
            url: format!("https://host{id}.example/feed"),
            kind: "feed".to_string(),
            schedule: "@hourly".to_string(),
            last_checked: None,
            next_due: None,
            enabled: true,
            consecutive_failures: 0,
            last_error: None,
            created_at: Utc::now(),
        })
        .collect();

    for workers in [1, 2, 4, 8].iter() {
        group.throughput(Throughput::Elements(subscriptions.len() as u64));
        group.bench_with_input(format!("{}_workers", workers), workers, |b, &workers| {
            b.iter(|| {
                rt.block_on(async {
                    let pool = WorkerPool::new(Arc::new(Noop), workers);
                    let report = pool.submit(subscriptions.clone());
                    pool.drain().await;
                    black_box(report.accepted)
                })
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_item_identity,
    bench_partition_new,
    bench_schedule_next_after,
    bench_worker_scaling,
);

criterion_main!(benches);
