use criterion::{black_box, criterion_group, criterion_main, Criterion};
use miscale::model::reading::{decode, encode_frame, Frame};
use miscale::model::stability::StabilityDetector;
use miscale::core::config::StabilizationPolicy;

fn bench_decode(c: &mut Criterion) {
    let frame = Frame::now(encode_frame(72.4, Some(500), true));
    c.bench_function("decode stabilized frame", |b| {
        b.iter(|| decode(black_box(&frame)))
    });

    let malformed = Frame::now(vec![0x02, 0x22, 0xE8]);
    c.bench_function("decode malformed frame", |b| {
        b.iter(|| decode(black_box(&malformed)))
    });
}

fn bench_window(c: &mut Criterion) {
    let readings: Vec<_> = (0..64)
        .filter_map(|i| decode(&Frame::now(encode_frame(70.0 + (i % 3) as f64 * 0.02, None, false))).ok())
        .collect();
    c.bench_function("window stabilization over 64 readings", |b| {
        b.iter(|| {
            let mut detector = StabilityDetector::new(StabilizationPolicy::window());
            for reading in &readings {
                black_box(detector.observe(reading));
            }
        })
    });
}

criterion_group!(benches, bench_decode, bench_window);
criterion_main!(benches);
