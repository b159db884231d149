use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage};

use decodepool_core::{DecodeError, MemoryPadding, MemorySpace, RunId};
use decodepool_decode::HostJpegCodecFactory;
use decodepool_gpu::{DeviceContext, TensorBatch};
use decodepool_pipeline::{
    decode_random_crop, decode_random_crop_partial, DecodeTask, PipelineConfig, PoolState,
    Registries, ThreadPool,
};

fn test_image(width: u32, height: u32, seed: u8) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([x as u8 ^ seed, y as u8, seed.wrapping_mul(3)])
    })
}

fn jpeg(width: u32, height: u32, seed: u8) -> Arc<[u8]> {
    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, 85)
        .encode_image(&test_image(width, height, seed))
        .unwrap();
    Arc::from(out.into_inner())
}

fn png(width: u32, height: u32, seed: u8) -> Arc<[u8]> {
    let mut out = Cursor::new(Vec::new());
    test_image(width, height, seed)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    Arc::from(out.into_inner())
}

fn host_pool(threads: usize) -> ThreadPool {
    ThreadPool::new(
        threads,
        Arc::new(DeviceContext::host_only()),
        Some(Arc::new(HostJpegCodecFactory)),
        MemoryPadding::default(),
    )
    .unwrap()
}

fn submit(pool: &ThreadPool, inputs: &[Arc<[u8]>]) -> Arc<TensorBatch> {
    let out = Arc::new(TensorBatch::new(inputs.len()));
    for (index, data) in inputs.iter().enumerate() {
        pool.add_task(DecodeTask::new(data.clone(), out.clone(), index, None, MemorySpace::Host).unwrap())
            .unwrap();
    }
    out
}

#[test]
fn every_slot_is_populated_after_run_all() {
    let pool = host_pool(3);
    let sizes = [(64, 48), (17, 33), (120, 90), (8, 8), (200, 10), (31, 64), (50, 50)];
    let inputs: Vec<_> = sizes
        .iter()
        .enumerate()
        .map(|(i, &(w, h))| if i % 3 == 0 { png(w, h, i as u8) } else { jpeg(w, h, i as u8) })
        .collect();

    let out = submit(&pool, &inputs);
    pool.run_all(true, true).unwrap();

    let tensors = Arc::try_unwrap(out).unwrap().into_tensors().unwrap();
    for (tensor, &(w, h)) in tensors.iter().zip(sizes.iter()) {
        assert_eq!(tensor.shape(), [h as usize, w as usize, 3]);
    }

    let stats = pool.stats();
    assert_eq!(stats.hardware_decoded + stats.software_decoded, sizes.len() as u64);
    // PNG inputs take the software path.
    assert_eq!(stats.software_decoded, 3);
    assert_eq!(stats.fallbacks, 3);
}

#[test]
fn sequential_batches_do_not_interleave() {
    let pool = host_pool(2);
    let first: Vec<_> = (0..5).map(|i| jpeg(20 + i, 10, i as u8)).collect();
    let second: Vec<_> = (0..3).map(|i| jpeg(10, 30 + i, 100 + i as u8)).collect();

    let out1 = submit(&pool, &first);
    pool.run_all(true, false).unwrap();
    let out2 = submit(&pool, &second);
    pool.run_all(true, true).unwrap();

    let a = Arc::try_unwrap(out1).unwrap().into_tensors().unwrap();
    let b = Arc::try_unwrap(out2).unwrap().into_tensors().unwrap();
    for (i, t) in a.iter().enumerate() {
        assert_eq!(t.shape(), [10, 20 + i, 3]);
    }
    for (i, t) in b.iter().enumerate() {
        assert_eq!(t.shape(), [30 + i, 10, 3]);
    }
    assert_eq!(pool.stats().batches, 2);
}

#[test]
fn run_without_wait_then_wait() {
    let pool = host_pool(2);
    let inputs: Vec<_> = (0..6).map(|i| jpeg(32, 32, i)).collect();
    let out = submit(&pool, &inputs);

    pool.run_all(false, true).unwrap();
    pool.wait().unwrap();
    assert_eq!(out.filled(), 6);
    assert_eq!(pool.state(), PoolState::Idle);
}

#[test]
fn empty_run_and_idle_wait_return_immediately() {
    let pool = host_pool(1);
    let started = Instant::now();
    pool.run_all(true, true).unwrap();
    pool.wait().unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn failed_slot_is_reported_and_others_complete() {
    let pool = host_pool(2);
    let inputs: Vec<Arc<[u8]>> = vec![
        jpeg(16, 16, 1),
        Arc::from(b"corrupted bytes".to_vec()),
        jpeg(24, 8, 2),
    ];
    let out = submit(&pool, &inputs);

    let err = pool.run_all(true, true).unwrap_err();
    match &err {
        DecodeError::Batch { failures, total } => {
            assert_eq!(*total, 3);
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].index, 1);
            assert!(matches!(failures[0].error, DecodeError::BothPathsFailed { index: 1, .. }));
        }
        other => panic!("unexpected {other}"),
    }
    assert!(out.is_filled(0));
    assert!(!out.is_filled(1));
    assert!(out.is_filled(2));
}

#[test]
fn shutdown_rejects_further_work_without_hanging() {
    let pool = host_pool(4);
    let out = submit(&pool, &[jpeg(8, 8, 0)]);
    pool.run_all(true, true).unwrap();

    pool.shutdown();
    assert_eq!(pool.state(), PoolState::ShutDown);
    let task = DecodeTask::new(jpeg(8, 8, 1), out.clone(), 0, None, MemorySpace::Host).unwrap();
    assert!(matches!(pool.add_task(task), Err(DecodeError::PoolShutDown)));
    assert!(matches!(pool.run_all(true, true), Err(DecodeError::PoolShutDown)));
    assert!(matches!(pool.wait(), Err(DecodeError::PoolShutDown)));
}

#[test]
fn decode_random_crop_reuses_run_state() {
    let config = PipelineConfig {
        num_threads: 3,
        seed: Some(7),
        ..PipelineConfig::default()
    };
    let registries = Registries::from_config(&config).unwrap();
    let run_id = RunId::derive("train", config.num_threads, "decode_random_crop", 0);
    let inputs: Vec<_> = (0..4).map(|i| jpeg(96, 64, i)).collect();

    let first = decode_random_crop(&registries, &inputs, run_id, &config).unwrap();
    assert_eq!(first.len(), 4);
    for tensor in &first {
        let [h, w, c] = tensor.shape();
        assert_eq!(c, 3);
        assert!(h > 0 && h <= 64 && w > 0 && w <= 96);
    }

    let pool = registries.pools.pool(run_id).unwrap();
    let generators = registries.generators.get_generators(run_id, 4, None).unwrap();

    // Second batch, smaller: same pool, same generators, continuing streams.
    let second = decode_random_crop(&registries, &inputs[..2], run_id, &config).unwrap();
    assert_eq!(second.len(), 2);
    assert!(Arc::ptr_eq(&pool, &registries.pools.pool(run_id).unwrap()));
    assert_eq!(generators.get(0).unwrap().samples_drawn(), 2);
    assert_eq!(generators.get(3).unwrap().samples_drawn(), 1);
    assert_eq!(pool.stats().batches, 2);

    registries.remove(run_id);
    assert_eq!(pool.state(), PoolState::ShutDown);
    assert!(registries.generators.is_empty());
}

#[test]
fn no_crop_config_returns_full_images() {
    let config = PipelineConfig::no_crop();
    let registries = Registries::default();
    let inputs = vec![jpeg(40, 30, 1), png(12, 7, 2)];

    let tensors = decode_random_crop(&registries, &inputs, RunId(99), &config).unwrap();
    assert_eq!(tensors[0].shape(), [30, 40, 3]);
    assert_eq!(tensors[1].shape(), [7, 12, 3]);
    assert!(registries.generators.is_empty());
}

#[test]
fn device_output_without_device_fails_the_batch() {
    let config = PipelineConfig {
        output_space: MemorySpace::Device(0),
        ..PipelineConfig::no_crop()
    };
    let registries = Registries::default();
    let err = decode_random_crop(&registries, &[jpeg(8, 8, 0)], RunId(5), &config).unwrap_err();
    assert_eq!(err.failed_slots(), vec![0]);
}

#[test]
fn partial_batch_keeps_decoded_slots() {
    let config = PipelineConfig {
        num_threads: 2,
        ..PipelineConfig::no_crop()
    };
    let registries = Registries::from_config(&config).unwrap();
    let corrupt: Arc<[u8]> = Arc::from(&b"\xFF\xD8 truncated"[..]);
    let inputs = vec![jpeg(20, 10, 1), corrupt, jpeg(16, 12, 2)];

    let batch = decode_random_crop_partial(&registries, &inputs, RunId(11), &config).unwrap();
    assert_eq!(batch.decoded(), 2);
    assert_eq!(batch.failed_slots(), vec![1]);
    assert_eq!(batch.error.as_ref().unwrap().failed_slots(), vec![1]);
    assert_eq!(batch.tensors[0].as_ref().unwrap().shape(), [10, 20, 3]);
    assert_eq!(batch.tensors[2].as_ref().unwrap().shape(), [12, 16, 3]);

    // The all-or-nothing entry point reports the same failure.
    let err = decode_random_crop(&registries, &inputs, RunId(11), &config).unwrap_err();
    assert_eq!(err.failed_slots(), vec![1]);
}
