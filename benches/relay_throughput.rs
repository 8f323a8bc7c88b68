//! Forwarding cost per record through the relay loop

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use evrelay::relay::{RECORD_SIZE_32, RECORD_SIZE_64};
use evrelay::{EventRelay, ExitReason, LivenessStrategy, RelayConfig, ShutdownFlag};
use rustix::pipe::pipe;
use std::fs::File;
use std::io::{Read, Write};
use std::time::Duration;

/// Stays well below the default 64 KiB pipe buffer
const RECORDS: usize = 1024;

fn relay_batch(record_size: usize, payload: &[u8]) {
    let (dev_rx, dev_tx) = pipe().unwrap();
    let (out_rx, out_tx) = pipe().unwrap();

    File::from(dev_tx).write_all(payload).unwrap();

    let mut relay = EventRelay::new(
        RelayConfig {
            record_size,
            poll_interval: Duration::from_millis(1000),
        },
        LivenessStrategy::None,
    );
    let reason = relay.run(&dev_rx, &out_tx, &ShutdownFlag::new()).unwrap();
    assert_eq!(reason, ExitReason::EndOfStream);
    drop(out_tx);

    let mut out = Vec::with_capacity(payload.len());
    File::from(out_rx).read_to_end(&mut out).unwrap();
    assert_eq!(out.len(), payload.len());
}

fn bench_relay(c: &mut Criterion) {
    let mut group = c.benchmark_group("relay");

    for record_size in [RECORD_SIZE_32, RECORD_SIZE_64] {
        let payload: Vec<u8> = (0..RECORDS * record_size).map(|i| i as u8).collect();
        group.throughput(Throughput::Elements(RECORDS as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(record_size),
            &payload,
            |b, payload| b.iter(|| relay_batch(record_size, payload)),
        );
    }

    group.finish();
}

criterion_group!(benches, bench_relay);
criterion_main!(benches);
