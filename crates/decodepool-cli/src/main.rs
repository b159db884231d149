use clap::Parser;
use tracing_subscriber::EnvFilter;

use decodepool_pipeline::Registries;

mod cli;

use cli::{Cli, Command};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    tracing::info!("decodepool v{}", env!("CARGO_PKG_VERSION"));

    let config = cli.pipeline_config()?;
    let registries = Registries::from_config(&config)?;

    match &cli.command {
        Command::Decode {
            input_dir,
            output_dir,
            batch_size,
            format,
        } => {
            let summary = cli::decode_dir(&registries, &config, input_dir, output_dir, *batch_size)?;
            cli::print_summary(&summary, format)?;
            if !summary.failed.is_empty() {
                tracing::warn!(failed = summary.failed.len(), "some images could not be decoded");
            }
        }
        Command::Bench {
            input_dir,
            batch_size,
            iterations,
        } => {
            let report = cli::bench_dir(&registries, &config, input_dir, *batch_size, *iterations)?;
            eprintln!(
                "[{} images in {:.1}ms, {:.1} images/s]",
                report.images, report.elapsed_ms, report.images_per_sec
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    registries.shutdown_all();
    Ok(())
}
