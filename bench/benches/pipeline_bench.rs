//! Decode pipeline benchmarks using criterion.
//!
//! Run with: cargo bench --bench pipeline_bench

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use decodepool_bench::{mixed_batch, synthetic_jpeg};
use decodepool_core::{CropConfig, RunId};
use decodepool_decode::probe_jpeg;
use decodepool_pipeline::{decode_random_crop, HardwareBackend, PipelineConfig, Registries};
use decodepool_roi::RandomRoiGenerator;

fn bench_roi_sampling(c: &mut Criterion) {
    let generator = RandomRoiGenerator::with_seed(CropConfig::default(), 1).unwrap();
    c.bench_function("roi/generate_random_roi", |b| {
        b.iter(|| std::hint::black_box(generator.generate_random_roi(640, 480)));
    });
}

fn bench_probe(c: &mut Criterion) {
    let data = synthetic_jpeg(1024, 768, 90).unwrap();
    c.bench_function("jpeg/probe", |b| {
        b.iter(|| std::hint::black_box(probe_jpeg(&data).unwrap()));
    });
}

fn bench_batch_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_decode");
    group.sample_size(10); // whole batches are slow

    let inputs = mixed_batch(32).unwrap();
    let total_bytes: usize = inputs.iter().map(|d| d.len()).sum();
    group.throughput(Throughput::Bytes(total_bytes as u64));

    for backend in [HardwareBackend::Host, HardwareBackend::None] {
        for &threads in &[1, 2, 4] {
            let config = PipelineConfig {
                num_threads: threads,
                backend,
                seed: Some(42),
                ..PipelineConfig::default()
            };
            let registries = Arc::new(Registries::from_config(&config).unwrap());
            let run_id = RunId::derive("bench", threads, "decode_random_crop", 0);

            group.bench_with_input(
                BenchmarkId::new(format!("{backend:?}"), threads),
                &threads,
                |b, _| {
                    b.iter(|| decode_random_crop(&registries, &inputs, run_id, &config).unwrap());
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_roi_sampling, bench_probe, bench_batch_decode);
criterion_main!(benches);
