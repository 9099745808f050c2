//! Benchmarks for case reference generation.
//!
//! Run with: `cargo bench -p census-rm-core`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::unwrap_used)] // Benchmarks can use unwrap for setup

use census_rm_core::case_ref::{CASE_REF_RANGE, CaseRefGenerator, FeistelDomain};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

fn bench_case_ref(c: &mut Criterion) {
    let generator = CaseRefGenerator::new(b"bench-secret").unwrap();

    c.bench_function("case_ref/single", |b| {
        let mut sequence = 0u64;
        b.iter(|| {
            sequence = (sequence + 1) % CASE_REF_RANGE;
            black_box(generator.case_ref(black_box(sequence)).unwrap())
        });
    });

    c.bench_function("case_ref/inverse", |b| {
        let case_ref = generator.case_ref(42).unwrap();
        b.iter(|| black_box(generator.sequence_for(black_box(case_ref)).unwrap()));
    });
}

fn bench_domains(c: &mut Criterion) {
    let mut group = c.benchmark_group("case_ref/domain");
    for range in [1_000u64, 1_000_000, CASE_REF_RANGE] {
        let domain = FeistelDomain::for_range(range).unwrap();
        let generator = CaseRefGenerator::with_domain(b"bench-secret", domain, 0).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(range), &range, |b, range| {
            b.iter(|| black_box(generator.permute(black_box(range / 2)).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_case_ref, bench_domains);
criterion_main!(benches);
