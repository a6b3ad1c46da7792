//! # catpng
//!
//! Stack local PNG strips of equal width into a single image.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use paster::concat;

/// Concatenate PNG images vertically, in the given order
#[derive(Parser)]
#[command(name = "catpng")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Images to concatenate, top first
    #[arg(value_name = "FILE", required = true, num_args = 2..)]
    files: Vec<PathBuf>,

    /// Output compression level
    #[arg(short, long, default_value_t = 6, value_parser = clap::value_parser!(u32).range(0..=9))]
    level: u32,

    /// Output file
    #[arg(short, long, default_value = "all.png")]
    output: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("PASTER_LOG")
                .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let image = concat::concat_files(&cli.files).await?;

    image
        .save(&cli.output, cli.level)
        .await
        .with_context(|| format!("cannot write `{}`", cli.output.display()))?;

    tracing::info!("Wrote {}x{} image to `{}`", image.header.width, image.header.height, cli.output.display());

    Ok(())
}
