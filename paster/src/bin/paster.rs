//! # paster
//!
//! Fetch every strip of an image from the fragment servers, and paste them together.

use std::num::{NonZeroU32, NonZeroU8, NonZeroUsize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use paster::assemble::{self, Layout};
use paster::config::{self, Config};
use paster::fetch::{Client, HttpSource, Url};
use paster::task;

/// Fetch a striped image concurrently and reassemble it
#[derive(Parser)]
#[command(name = "paster")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Number of concurrent fetch workers
    #[arg(short = 't', long, default_value = "1")]
    threads: NonZeroU8,

    /// Image to fetch from the default servers
    #[arg(short = 'n', long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=3))]
    image: u8,

    /// Fragment server to fetch from instead of the default ones, can be repeated
    #[arg(short, long = "endpoint", value_name = "URL")]
    endpoints: Vec<Url>,

    /// Number of strips the image is split into
    #[arg(short = 'k', long, default_value_t = config::DEFAULT_FRAGMENTS)]
    fragments: NonZeroUsize,

    /// Per-request timeout, in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Give up on a server after this many failed fetches in a row
    #[arg(long, value_name = "COUNT")]
    max_failures: Option<NonZeroU32>,

    /// Height of the final image, when not derived from the strips
    #[arg(long)]
    height: Option<u32>,

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

    let endpoints = if cli.endpoints.is_empty() {
        config::default_endpoints(cli.image)?
    } else {
        cli.endpoints
    };

    let config = Config::default()
        .with_workers(cli.threads)
        .with_fragments(cli.fragments)
        .with_timeout(cli.timeout.map(Duration::from_secs))
        .with_max_consecutive_failures(cli.max_failures)
        .with_compression(cli.level)
        .with_layout(cli.height.map_or(Layout::Derived, Layout::Fixed));

    let client = Client::builder().build().context("cannot build HTTP client")?;
    let sources = endpoints
        .into_iter()
        .map(|url| Arc::new(HttpSource::new(url).with_client(client.clone())))
        .collect();

    let (store, report) = task::run(&config, sources).await?;

    tracing::info!(
        "Found all {} fragments in {} fetches ({} duplicates, {} failures)",
        store.capacity(),
        report.fetched,
        report.duplicates,
        report.failures
    );

    let image = assemble::assemble(&store, config.layout())?;

    image
        .save(&cli.output, config.compression())
        .await
        .with_context(|| format!("cannot write `{}`", cli.output.display()))?;

    tracing::info!("Wrote {}x{} image to `{}`", image.header.width, image.header.height, cli.output.display());

    Ok(())
}
