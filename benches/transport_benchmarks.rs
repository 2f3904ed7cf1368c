//! Transport benchmarks
//!
//! Benchmarks payload fragmentation and loopback round trips through the
//! reactor pool.
//!
//! Run with: `cargo bench --bench transport_benchmarks`

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use drift_transport::fragment::split;
use drift_transport::{Client, Datagram, EndpointConfig, ReactorConfig, ReactorPool};

/// Benchmark splitting payloads at the default fragment bound
fn bench_fragmentation(c: &mut Criterion) {
    let mut group = c.benchmark_group("fragmentation");

    for size in [1024, 8192, 65_536, 1_048_576] {
        let payload = Bytes::from(vec![0xAA; size]);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| black_box(split(payload, 8192)));
        });
    }

    group.finish();
}

/// Benchmark a send plus matching receive between two loopback clients
fn bench_loopback_round_trip(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let pool = ReactorPool::new(ReactorConfig {
        threads: 1,
        ..Default::default()
    })
    .unwrap();
    let config = EndpointConfig::default().with_local_host("127.0.0.1");

    let (sender, receiver) = runtime.block_on(async {
        (
            Client::bind(&pool, &config).await.unwrap(),
            Client::bind(&pool, &config).await.unwrap(),
        )
    });

    let mut group = c.benchmark_group("loopback_round_trip");
    for size in [64, 1024, 8192] {
        let datagram = Datagram::new(vec![0x55; size], receiver.local_addr());
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &datagram, |b, datagram| {
            b.iter(|| {
                runtime.block_on(async {
                    sender.send_datagram(datagram).await.unwrap();
                    black_box(receiver.receive_datagram().await.unwrap());
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fragmentation, bench_loopback_round_trip);
criterion_main!(benches);
