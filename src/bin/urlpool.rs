//! urlpool administrative CLI
//!
//! Operates directly on the pool journals and media cache of one data
//! directory. Every command prints JSON on stdout; logs go to stderr and a
//! daily-rolling file.
//!
//! # Examples
//!
//! ```bash
//! # Register a url in the text/image pool, resized to 512px when fetched
//! urlpool register text https://example.com/cat.png --max-size 512
//!
//! # Register several video urls
//! urlpool register-batch video https://v/1.mp4 https://v/2.mp4
//!
//! # Look up slot 42
//! urlpool resolve text 42
//!
//! # Download and fit an image
//! urlpool fetch-image https://example.com/cat.png --size 256 --output cat.png
//! ```

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use urlpool::{PoolKind, ServiceConfig, SlotId, SlotOptions, UrlPoolService};

/// urlpool - stable integer slots for volatile URLs
#[derive(Parser, Debug)]
#[command(name = "urlpool")]
#[command(version = urlpool::VERSION)]
#[command(about = "Stable integer slots for volatile URLs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "URLPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory path (overrides the configuration file)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Media cache directory (overrides the configuration file)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "URLPOOL_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn", env = "URLPOOL_LOG_LEVEL")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bind a url to a slot, or renew its existing slot
    Register(RegisterArgs),

    /// Register several urls in one transaction
    RegisterBatch(RegisterBatchArgs),

    /// Show the live slot with the given id
    Resolve {
        /// Pool (text, image, video)
        pool: PoolKind,
        /// Slot id
        id: u32,
    },

    /// Download an image, fitted inside a size bound
    FetchImage(FetchImageArgs),

    /// Show pool occupancy
    Stats,

    /// Rewrite pool journals as snapshots
    Compact,

    /// Show version
    Version,
}

#[derive(Args, Debug)]
struct RegisterArgs {
    /// Pool (text, image, video)
    pool: PoolKind,

    /// Url to register
    url: String,

    #[command(flatten)]
    options: OptionArgs,
}

#[derive(Args, Debug)]
struct RegisterBatchArgs {
    /// Pool (text, image, video)
    pool: PoolKind,

    /// Urls to register
    #[arg(required = true)]
    urls: Vec<String>,

    #[command(flatten)]
    options: OptionArgs,
}

#[derive(Args, Debug)]
struct OptionArgs {
    /// Longest-edge bound for image responses (0 = pass through)
    #[arg(long, default_value = "0")]
    max_size: u32,

    /// Never keep processed image bytes on disk
    #[arg(long)]
    no_cache: bool,
}

impl OptionArgs {
    fn slot_options(&self) -> SlotOptions {
        SlotOptions::new(self.max_size, !self.no_cache)
    }
}

#[derive(Args, Debug)]
struct FetchImageArgs {
    /// Image url
    url: String,

    /// Longest-edge bound (0 = pass through)
    #[arg(short, long, default_value = "0")]
    size: u32,

    /// Skip the disk cache
    #[arg(long)]
    no_cache: bool,

    /// Output file path
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Serialize)]
struct FetchSummary<'a> {
    url: &'a str,
    size: u32,
    bytes: usize,
    output: &'a PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("urlpool {}", urlpool::VERSION);
        return Ok(());
    }

    setup_logging(&cli)?;

    let config = load_config(&cli)?;
    let service = UrlPoolService::open(&config).context("Failed to open urlpool service")?;

    let result = run_command(&service, cli.command).await;
    service.shutdown().await;
    result
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)
        .with_context(|| format!("Failed to create log dir {}", cli.log_dir.display()))?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "urlpool.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<ServiceConfig> {
    let mut config = ServiceConfig::load(cli.config.as_deref())?;
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(cache_dir) = &cli.cache_dir {
        config.cache_dir = cache_dir.clone();
    }
    Ok(config)
}

async fn run_command(service: &UrlPoolService, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Register(args) => {
            let registration = service
                .register(args.pool, &args.url, args.options.slot_options())
                .await?;
            print_json(&registration)
        }
        Commands::RegisterBatch(args) => {
            let slots = service
                .register_batch(args.pool, &args.urls, args.options.slot_options())
                .await?;
            print_json(&slots)
        }
        Commands::Resolve { pool, id } => {
            let slot = service.resolve(pool, SlotId::new(id)).await?;
            print_json(&slot)
        }
        Commands::FetchImage(args) => fetch_image_command(service, args).await,
        Commands::Stats => print_json(&service.stats().await?),
        Commands::Compact => {
            service.compact().await?;
            info!("Journals compacted");
            print_json(&service.stats().await?.pools)
        }
        Commands::Version => Ok(()),
    }
}

async fn fetch_image_command(service: &UrlPoolService, args: FetchImageArgs) -> anyhow::Result<()> {
    let bytes = service
        .fetch_image(&args.url, args.size, !args.no_cache)
        .await?;
    tokio::fs::write(&args.output, &bytes)
        .await
        .with_context(|| format!("Failed to write {}", args.output.display()))?;

    print_json(&FetchSummary {
        url: &args.url,
        size: args.size,
        bytes: bytes.len(),
        output: &args.output,
    })
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
