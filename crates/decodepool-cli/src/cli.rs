use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;

use decodepool_core::RunId;
use decodepool_gpu::Tensor;
use decodepool_pipeline::{
    decode_random_crop, decode_random_crop_partial, HardwareBackend, PipelineConfig, PoolStats,
    Registries,
};

#[derive(Parser)]
#[command(name = "decodepool", about = "Parallel image decode with random crops")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to a JSON pipeline config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Device index (local rank) the pool binds to.
    #[arg(long, global = true)]
    pub device: Option<usize>,

    /// Decode worker threads.
    #[arg(long, global = true)]
    pub threads: Option<usize>,

    /// Hardware stage backend.
    #[arg(long, global = true)]
    pub backend: Option<Backend>,

    /// Seed for reproducible crops.
    #[arg(long, global = true)]
    pub seed: Option<u64>,

    /// Decode full images without cropping.
    #[arg(long, global = true)]
    pub no_crop: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Command {
    /// Decode every image in a directory and write the outputs as PNG.
    Decode {
        #[arg(required = true)]
        input_dir: PathBuf,
        #[arg(required = true)]
        output_dir: PathBuf,
        /// Images per batch.
        #[arg(long, default_value = "32")]
        batch_size: usize,
        /// Summary format.
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },
    /// Repeatedly decode a directory as one run and report throughput.
    Bench {
        #[arg(required = true)]
        input_dir: PathBuf,
        #[arg(long, default_value = "32")]
        batch_size: usize,
        /// Passes over the input set.
        #[arg(long, default_value = "10")]
        iterations: usize,
    },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum Backend {
    Host,
    Nvjpeg,
    None,
}

impl From<Backend> for HardwareBackend {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Host => HardwareBackend::Host,
            Backend::Nvjpeg => HardwareBackend::NvJpeg,
            Backend::None => HardwareBackend::None,
        }
    }
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl Cli {
    /// Config file (or defaults) with command-line overrides applied.
    pub fn pipeline_config(&self) -> anyhow::Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let data = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?
            }
            None => PipelineConfig::default(),
        };

        if let Some(device) = self.device {
            config.local_rank = device;
        }
        if let Some(threads) = self.threads {
            config.num_threads = threads;
        }
        if let Some(backend) = self.backend {
            config.backend = backend.into();
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if self.no_crop {
            config.crop = false;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Serialize)]
pub struct OutputEntry {
    pub input: PathBuf,
    pub output: PathBuf,
    pub width: usize,
    pub height: usize,
}

#[derive(Debug, Serialize)]
pub struct DecodeSummary {
    pub images: usize,
    pub batches: usize,
    pub failed: Vec<PathBuf>,
    pub elapsed_ms: f64,
    pub pool: Option<PoolStats>,
    pub outputs: Vec<OutputEntry>,
}

/// Readable files of `dir`, sorted by name.
pub fn load_inputs(dir: &Path) -> anyhow::Result<Vec<(PathBuf, Arc<[u8]>)>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let data = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            Ok((path, Arc::from(data)))
        })
        .collect()
}

pub fn run_id(mode: &str, config: &PipelineConfig) -> RunId {
    RunId::derive(mode, config.num_threads, "decode_random_crop", config.local_rank)
}

pub fn decode_dir(
    registries: &Registries,
    config: &PipelineConfig,
    input_dir: &Path,
    output_dir: &Path,
    batch_size: usize,
) -> anyhow::Result<DecodeSummary> {
    anyhow::ensure!(batch_size > 0, "batch size must be at least 1");
    let inputs = load_inputs(input_dir)?;
    std::fs::create_dir_all(output_dir)?;

    let run_id = run_id("decode", config);
    let started = Instant::now();
    let mut summary = DecodeSummary {
        images: inputs.len(),
        batches: 0,
        failed: Vec::new(),
        elapsed_ms: 0.0,
        pool: None,
        outputs: Vec::new(),
    };

    for chunk in inputs.chunks(batch_size) {
        let data: Vec<_> = chunk.iter().map(|(_, bytes)| bytes.clone()).collect();
        summary.batches += 1;

        let batch = match decode_random_crop_partial(registries, &data, run_id, config) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!(error = %e, "batch failed");
                summary.failed.extend(chunk.iter().map(|(p, _)| p.clone()));
                continue;
            }
        };
        if let Some(e) = &batch.error {
            tracing::error!(error = %e, decoded = batch.decoded(), "batch partially failed");
        }

        for ((path, _), tensor) in chunk.iter().zip(batch.tensors) {
            let Some(tensor) = tensor else {
                summary.failed.push(path.clone());
                continue;
            };
            let output = output_path(output_dir, path);
            save_png(registries, run_id, &tensor, &output)?;
            tracing::debug!(input = %path.display(), output = %output.display(), "wrote");
            summary.outputs.push(OutputEntry {
                input: path.clone(),
                output,
                width: tensor.width(),
                height: tensor.height(),
            });
        }
    }

    summary.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    summary.pool = registries.pools.pool(run_id).map(|pool| pool.stats());
    Ok(summary)
}

/// `<file name>.png`, keeping the input extension so `cat.jpg` and
/// `cat.png` do not collide.
fn output_path(output_dir: &Path, input: &Path) -> PathBuf {
    let name = input
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    output_dir.join(format!("{name}.png"))
}

fn save_png(registries: &Registries, run_id: RunId, tensor: &Tensor, path: &Path) -> anyhow::Result<()> {
    let pixels = match tensor.host_data() {
        Some(data) => data.to_vec(),
        None => {
            let pool = registries
                .pools
                .pool(run_id)
                .context("device tensor without a pool")?;
            tensor.to_host(pool.device_context())?
        }
    };
    image::save_buffer(
        path,
        &pixels,
        tensor.width() as u32,
        tensor.height() as u32,
        image::ExtendedColorType::Rgb8,
    )
    .with_context(|| format!("writing {}", path.display()))
}

pub fn print_summary(summary: &DecodeSummary, format: &OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Text => {
            for entry in &summary.outputs {
                println!(
                    "{} -> {} ({}x{})",
                    entry.input.display(),
                    entry.output.display(),
                    entry.width,
                    entry.height
                );
            }
            for path in &summary.failed {
                println!("{} FAILED", path.display());
            }
            eprintln!(
                "\n[{} images in {} batches, {} failed, {:.1}ms]",
                summary.images,
                summary.batches,
                summary.failed.len(),
                summary.elapsed_ms
            );
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(summary)?);
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct BenchReport {
    pub images: usize,
    pub iterations: usize,
    pub elapsed_ms: f64,
    pub images_per_sec: f64,
    pub pool: Option<PoolStats>,
}

pub fn bench_dir(
    registries: &Registries,
    config: &PipelineConfig,
    input_dir: &Path,
    batch_size: usize,
    iterations: usize,
) -> anyhow::Result<BenchReport> {
    anyhow::ensure!(batch_size > 0, "batch size must be at least 1");
    let inputs: Vec<_> = load_inputs(input_dir)?
        .into_iter()
        .map(|(_, data)| data)
        .collect();
    anyhow::ensure!(!inputs.is_empty(), "no input files in {}", input_dir.display());

    let run_id = run_id("bench", config);
    // Warm up: creates the pool and generators outside the timed loop.
    decode_random_crop(registries, &inputs[..batch_size.min(inputs.len())], run_id, config)?;

    let started = Instant::now();
    let mut images = 0;
    for iteration in 0..iterations {
        for chunk in inputs.chunks(batch_size) {
            images += decode_random_crop(registries, chunk, run_id, config)?.len();
        }
        tracing::debug!(iteration, images, "bench pass complete");
    }
    let elapsed = started.elapsed().as_secs_f64();

    Ok(BenchReport {
        images,
        iterations,
        elapsed_ms: elapsed * 1000.0,
        images_per_sec: if elapsed > 0.0 { images as f64 / elapsed } else { 0.0 },
        pool: registries.pools.pool(run_id).map(|pool| pool.stats()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply_on_top_of_defaults() {
        let cli = Cli::parse_from([
            "decodepool",
            "--threads",
            "6",
            "--backend",
            "none",
            "--no-crop",
            "bench",
            "images",
        ]);
        let config = cli.pipeline_config().unwrap();
        assert_eq!(config.num_threads, 6);
        assert_eq!(config.backend, HardwareBackend::None);
        assert!(!config.crop);
    }

    #[test]
    fn test_output_path_keeps_input_extension() {
        let out = output_path(Path::new("/tmp/out"), Path::new("/data/cat.01.jpg"));
        assert_eq!(out, PathBuf::from("/tmp/out/cat.01.jpg.png"));
        assert_ne!(
            output_path(Path::new("/tmp/out"), Path::new("/data/cat.jpg")),
            output_path(Path::new("/tmp/out"), Path::new("/data/cat.png"))
        );
    }

    #[test]
    fn test_run_ids_differ_by_mode() {
        let config = PipelineConfig::default();
        assert_ne!(run_id("decode", &config), run_id("bench", &config));
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("decodepool-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_jpeg(path: &Path, width: u32, height: u32) {
        let img = image::RgbImage::from_fn(width, height, |x, y| image::Rgb([x as u8, y as u8, 128]));
        img.save_with_format(path, image::ImageFormat::Jpeg).unwrap();
    }

    #[test]
    fn test_corrupt_file_does_not_drop_its_batch() {
        let root = scratch_dir("partial");
        let input = root.join("in");
        let output = root.join("out");
        std::fs::create_dir_all(&input).unwrap();
        write_jpeg(&input.join("a.jpg"), 20, 10);
        std::fs::write(input.join("b.jpg"), b"\xFF\xD8 not really a jpeg").unwrap();
        write_jpeg(&input.join("c.jpg"), 12, 8);

        let config = PipelineConfig {
            num_threads: 2,
            ..PipelineConfig::no_crop()
        };
        let registries = Registries::from_config(&config).unwrap();
        let summary = decode_dir(&registries, &config, &input, &output, 32).unwrap();

        assert_eq!(summary.images, 3);
        assert_eq!(summary.batches, 1);
        assert_eq!(summary.failed, vec![input.join("b.jpg")]);
        assert_eq!(summary.outputs.len() + summary.failed.len(), summary.images);
        let written: Vec<_> = summary.outputs.iter().map(|o| o.output.clone()).collect();
        assert_eq!(written, vec![output.join("a.jpg.png"), output.join("c.jpg.png")]);
        assert!(written.iter().all(|p| p.is_file()));
        assert_eq!((summary.outputs[0].width, summary.outputs[0].height), (20, 10));

        registries.shutdown_all();
        let _ = std::fs::remove_dir_all(&root);
    }
}
