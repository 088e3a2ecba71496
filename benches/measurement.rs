use criterion::{criterion_group, criterion_main, Criterion};
use enclave_monitor::channel::{pair, SharedBuffer};
use enclave_monitor::measure::{extend_history, measure_artifacts, measure_platform, ConnectionEvent};
use std::sync::Arc;

fn bench_measurement(c: &mut Criterion) {
    let loader = vec![0x4cu8; 16 * 1024];
    let runtime = vec![0x52u8; 128 * 1024];
    let app = vec![0x41u8; 512 * 1024];

    c.bench_function("measure_artifacts_656k", |b| {
        b.iter(|| measure_artifacts(&loader, &runtime, &app))
    });

    let image = vec![0x4du8; 200 * 1024];
    c.bench_function("measure_platform_2m", |b| {
        b.iter(|| measure_platform(&image, 0x1ff000))
    });

    let d0 = measure_artifacts(&loader, &runtime, b"a");
    let d1 = measure_artifacts(&loader, &runtime, b"b");
    c.bench_function("extend_history_connect", |b| {
        b.iter(|| extend_history(&d0, &d1, ConnectionEvent::Connect))
    });
}

fn bench_mailbox(c: &mut Criterion) {
    let (tx, rx) = pair(Arc::new(SharedBuffer::new(256)));
    let payload = [7u8; 200];
    let mut out = [0u8; 256];

    c.bench_function("mailbox_send_recv_200b", |b| {
        b.iter(|| {
            tx.send(&payload);
            rx.recv(&mut out)
        })
    });
}

criterion_group!(benches, bench_measurement, bench_mailbox);
criterion_main!(benches);
