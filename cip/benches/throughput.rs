#![allow(
    clippy::unwrap_used,
    clippy::default_numeric_fallback,
    reason = "benchmark"
)]

use {
    criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main},
    hfile::Registry,
    hfile_cip::{CipHandler, CipOptions, KeySource},
    tempfile::TempDir,
};

fn criterion_benchmark(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let url = format!("cip:{}", dir.path().join("bench.enc").display());
    let mut registry = Registry::new();
    CipHandler::new(CipOptions {
        key_source: KeySource::fixed("benchmark passphrase"),
        ..CipOptions::default()
    })
    .register(&mut registry);

    let mut group = c.benchmark_group("encrypt");
    for size in [1024, 1024 * 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || (0..size).map(|_| rand::random::<u8>()).collect::<Vec<u8>>(),
                |input| {
                    let mut file = registry.open(&url, "w").unwrap();
                    file.write_all(&input).unwrap();
                    file.close().unwrap();
                },
                BatchSize::SmallInput,
            );
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
