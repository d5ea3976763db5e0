use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use trestle::message::HEADER_SZ;
use trestle::{NoopInstrument, Pool, WireMessage};

fn bench_insert_data(c: &mut Criterion) {
    let pool = Pool::new(
        "bench",
        HEADER_SZ + 16 * 1024,
        Arc::new(NoopInstrument),
    );
    let payload: Vec<u8> = (0..16 * 1024).map(|i| i as u8).collect();

    for &sz in &[8usize, 256, 1024, 4096] {
        c.bench_function(&format!("insert_data_{}", sz), |b| {
            b.iter(|| {
                let mut wm = WireMessage::data(0, &payload[..sz], &pool).unwrap();
                wm.insert_data(black_box(&payload[..8])).unwrap();
                black_box(&wm);
            })
        });
    }
}

fn bench_append_data(c: &mut Criterion) {
    let pool = Pool::new(
        "bench",
        HEADER_SZ + 16 * 1024,
        Arc::new(NoopInstrument),
    );
    let payload: Vec<u8> = (0..16 * 1024).map(|i| i as u8).collect();

    for &sz in &[8usize, 256, 1024, 4096] {
        c.bench_function(&format!("append_data_{}", sz), |b| {
            b.iter(|| {
                let mut wm = WireMessage::data(0, &payload[..sz], &pool).unwrap();
                wm.append_data(black_box(&payload[..8])).unwrap();
                black_box(&wm);
            })
        });
    }
}

criterion_group!(benches, bench_insert_data, bench_append_data);
criterion_main!(benches);
