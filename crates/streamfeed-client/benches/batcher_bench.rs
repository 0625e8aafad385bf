//! Batching Performance Benchmarks
//!
//! Measures batch formation and the end-to-end producer path.
//!
//! ## Benchmarks
//!
//! ### 1. Batch Selection (`bench_batch_selection`)
//! - Drains a queue of records into batches with `Batcher::select`
//! - Tests different queue lengths (100, 1000, 10000 records)
//! - **Target**: < 1ms for 10000 records
//!
//! ### 2. Mixed Record Sizes (`bench_mixed_sizes`)
//! - Same as above with payloads from 16 bytes to 64 KiB, so the byte
//!   budget rather than the count closes most batches
//!
//! ### 3. Producer Throughput (`bench_producer_throughput`)
//! - Enqueues records through a `Producer` into a `MemoryStream` and waits
//!   for every completion handle
//!
//! ## Running
//!
//! ```bash
//! # Run all benchmarks
//! cargo bench -p streamfeed-client
//!
//! # Run specific benchmark
//! cargo bench -p streamfeed-client --bench batcher_bench batch_selection
//! ```

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::collections::VecDeque;
use std::time::Duration;
use streamfeed_client::{Batcher, MemoryStream, Producer, ProducerConfig, Record};

fn create_test_record(i: usize, value_size: usize) -> Record {
    Record::new(format!("key{}", i % 64), Bytes::from(vec![b'x'; value_size]))
}

fn bench_batch_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_selection");
    let batcher = Batcher::new(500, 5 * 1024 * 1024);

    for count in [100, 1000, 10000] {
        let records: Vec<Record> = (0..count).map(|i| create_test_record(i, 1024)).collect();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("records", count), &records, |b, records| {
            b.iter(|| {
                let mut queue: VecDeque<Record> = records.iter().cloned().collect();
                let mut batches = 0;
                while !queue.is_empty() {
                    let selection = batcher.select(&mut queue);
                    batches += 1;
                    black_box(selection);
                }
                black_box(batches);
            });
        });
    }

    group.finish();
}

fn bench_mixed_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixed_sizes");
    let batcher = Batcher::new(500, 5 * 1024 * 1024);

    let sizes = [16, 256, 4096, 65536];
    let records: Vec<Record> = (0..2000)
        .map(|i| create_test_record(i, sizes[i % sizes.len()]))
        .collect();

    group.throughput(Throughput::Elements(records.len() as u64));
    group.bench_function("select_all", |b| {
        b.iter(|| {
            let mut queue: VecDeque<Record> = records.iter().cloned().collect();
            while !queue.is_empty() {
                black_box(batcher.select(&mut queue));
            }
        });
    });

    group.finish();
}

fn bench_producer_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("producer_throughput");
    group.sample_size(20);

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => panic!("failed to build runtime: {e}"),
    };

    for count in [1000, 10000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("records", count), &count, |b, &count| {
            b.to_async(&rt).iter(|| async move {
                let config = ProducerConfig::builder()
                    .flush_interval(Duration::from_millis(1))
                    .build()
                    .unwrap();
                let producer = Producer::start(config, MemoryStream::new()).unwrap();

                let mut handles = Vec::with_capacity(count);
                for i in 0..count {
                    handles.push(producer.enqueue(create_test_record(i, 256)).await.unwrap());
                }
                for handle in handles {
                    black_box(handle.await.unwrap());
                }
                producer.close().await.unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_batch_selection,
    bench_mixed_sizes,
    bench_producer_throughput
);
criterion_main!(benches);
