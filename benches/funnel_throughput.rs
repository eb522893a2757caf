//! Throttling and correlation throughput benchmark.
//!
//! Measures funnel admission overhead at several concurrency caps and the
//! insert/complete cycle of the correlation table using Criterion.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use faast_core::invoke::CorrelationTable;
use faast_core::{Call, Funnel, Return};
use std::sync::Arc;

fn bench_funnel_push(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let caps: &[usize] = &[1, 8, 64, 0];

    let mut group = c.benchmark_group("funnel_push_100");
    for &cap in caps {
        let funnel = Funnel::new(cap);
        group.bench_with_input(BenchmarkId::from_parameter(cap), &funnel, |b, funnel| {
            b.iter(|| {
                rt.block_on(async {
                    let tasks = (0..100u64).map(|i| funnel.push(move || async move { Ok(black_box(i)) }));
                    futures::future::join_all(tasks).await
                })
            });
        });
    }
    group.finish();
}

fn bench_correlation(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let table = CorrelationTable::new();

    c.bench_function("correlation_insert_complete", |b| {
        b.iter(|| {
            rt.block_on(async {
                let call = Arc::new(Call::new("bench", Bytes::from_static(b"[1,2]")));
                let (rx, _failures) = table.insert(call.clone()).unwrap();
                table.complete(Return::success(call.call_id.clone(), Bytes::from_static(b"3")));
                black_box(rx.await.unwrap().unwrap())
            })
        });
    });
}

criterion_group!(benches, bench_funnel_push, bench_correlation);
criterion_main!(benches);
