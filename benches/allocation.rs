//! Benchmarks for best-fit planning and ledger allocation passes

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tapeledger_rs::core::allocator::{plan_allocation, FileDemand, TapeBin};
use tapeledger_rs::{Allocator, ArchiveConfig, Ledger, NewFile, NewTape};

const GIB: u64 = 1 << 30;

fn random_files(count: usize, rng: &mut StdRng) -> Vec<FileDemand> {
    (0..count)
        .map(|i| FileDemand {
            file_id: i as i64,
            size: rng.gen_range(GIB / 4..8 * GIB),
        })
        .collect()
}

fn benchmark_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_allocation");
    let mut rng = StdRng::seed_from_u64(0x7a9e);

    for count in [100, 1_000, 10_000].iter() {
        let files = random_files(*count, &mut rng);
        let bins: Vec<TapeBin> = (0..64)
            .map(|i| TapeBin {
                tape_id: i,
                free: 12_000 * GIB,
            })
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| plan_allocation(black_box(&files), bins.clone()));
        });
    }

    group.finish();
}

fn benchmark_ledger_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_allocation_pass");
    group.sample_size(10);

    for count in [100, 1_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter_with_setup(
                || {
                    let dir = tempfile::TempDir::new().unwrap();
                    let mut config = ArchiveConfig::new(dir.path().join("ledger.db"));
                    config.ledger.min_tape_capacity = 1;
                    let ledger = Ledger::open(&config).unwrap();
                    for t in 0..16 {
                        ledger
                            .register_tape(NewTape::new(format!("HERA_{:02}", t), 12_000 * GIB))
                            .unwrap();
                    }
                    let mut rng = StdRng::seed_from_u64(count as u64);
                    for i in 0..count {
                        let size = rng.gen_range(GIB / 4..8 * GIB);
                        ledger
                            .stage_file(NewFile::new(format!("/staging/f{}.uvh5", i), size))
                            .unwrap();
                    }
                    (dir, ledger)
                },
                |(_dir, ledger)| {
                    Allocator::without_spares().run(&ledger).unwrap();
                },
            );
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_plan, benchmark_ledger_pass);
criterion_main!(benches);
