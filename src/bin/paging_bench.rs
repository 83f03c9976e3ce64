//! Binary entry point for the paging benchmark.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use largeimage::{
    CacheManager, CacheStats, Dims, Element, ImageOptions, ImageStats, LargeImage, PagingConfig,
};

#[derive(Parser, Debug)]
#[command(
    name = "paging-bench",
    version,
    about = "Write and verify a pixel pattern through the paged image cache"
)]
struct Cli {
    #[arg(long, value_enum, default_value_t = ElementArg::Int, help = "Pixel element type")]
    element: ElementArg,

    #[arg(long, default_value_t = 1024, help = "Image width")]
    width: u64,

    #[arg(long, default_value_t = 1024, help = "Image height")]
    height: u64,

    #[arg(long, default_value_t = 1, help = "Number of bands")]
    bands: u64,

    #[arg(long, value_name = "BYTES", help = "Heap bytes per page")]
    page_bytes: Option<u64>,

    #[arg(long, value_name = "BYTES", help = "Heap budget of the cache manager")]
    heap_budget: Option<u64>,

    #[arg(long, value_name = "MS", help = "Sleep between backpressure polls")]
    backpressure_interval_ms: Option<u64>,

    #[arg(long, value_name = "MS", help = "Heap monitor polling interval")]
    monitor_interval_ms: Option<u64>,

    #[arg(long, value_name = "N", default_value_t = 10_000, help = "Random reads to verify")]
    random_reads: u64,

    #[arg(long, default_value_t = 42, help = "Seed for the random read pass")]
    seed: u64,

    #[arg(long, value_name = "FILE", help = "Paging config file (TOML)")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Directory for backing files")]
    temp_dir: Option<PathBuf>,

    #[arg(
        long,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for the report"
    )]
    format: OutputFormat,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
enum ElementArg {
    Byte,
    Bool,
    Int,
    Double,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct BenchReport {
    element: ElementArg,
    dims: Dims,
    page_size: u64,
    page_count: u64,
    pixels: u64,
    write_ms: u128,
    sequential_verify_ms: u128,
    random_verify_ms: u128,
    mismatches: u64,
    cache: CacheStats,
    image: ImageStats,
}

/// Deterministic value written at each linear index.
trait Pattern: Element {
    fn pattern(index: u64) -> Self;
}

impl Pattern for u8 {
    fn pattern(index: u64) -> Self {
        (index % 251) as u8
    }
}

impl Pattern for bool {
    fn pattern(index: u64) -> Self {
        index % 3 == 0
    }
}

impl Pattern for i32 {
    fn pattern(index: u64) -> Self {
        (index as i32).wrapping_mul(31).wrapping_sub(7)
    }
}

impl Pattern for f64 {
    fn pattern(index: u64) -> Self {
        index as f64 * 0.5 - 3.0
    }
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = build_config(&cli)?;
    let (manager, monitor) = CacheManager::start(config)?;
    let dims = Dims::new(cli.width, cli.height, 1, 1, cli.bands);
    let report = match cli.element {
        ElementArg::Byte => bench::<u8>(&manager, &cli, dims)?,
        ElementArg::Bool => bench::<bool>(&manager, &cli, dims)?,
        ElementArg::Int => bench::<i32>(&manager, &cli, dims)?,
        ElementArg::Double => bench::<f64>(&manager, &cli, dims)?,
    };
    monitor.shutdown();

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_text(&report),
    }
    if report.mismatches > 0 {
        return Err(format!("{} pixels read back wrong", report.mismatches).into());
    }
    Ok(())
}

fn build_config(cli: &Cli) -> Result<PagingConfig, Box<dyn Error>> {
    let mut config = match &cli.config {
        Some(path) => PagingConfig::load(path)?,
        None => PagingConfig::discover()?,
    };
    if let Some(budget) = cli.heap_budget {
        config.heap_budget_bytes = budget;
    }
    if let Some(bytes) = cli.page_bytes {
        config.page_bytes = Some(bytes);
    }
    if let Some(ms) = cli.backpressure_interval_ms {
        config.backpressure_interval_ms = ms;
    }
    if let Some(ms) = cli.monitor_interval_ms {
        config.monitor_interval_ms = ms;
    }
    if let Some(dir) = &cli.temp_dir {
        config.temp_dir = Some(dir.clone());
    }
    config.validate()?;
    Ok(config)
}

fn bench<T: Pattern>(
    manager: &Arc<CacheManager>,
    cli: &Cli,
    dims: Dims,
) -> Result<BenchReport, Box<dyn Error>> {
    let image = LargeImage::<T>::create(manager, dims, ImageOptions::default())?;
    let pixels = dims.total_pixels().ok_or("pixel count overflows u64")?;

    let started = Instant::now();
    for index in 0..pixels {
        image.set_index(index, T::pattern(index))?;
    }
    let write_ms = started.elapsed().as_millis();

    let mut mismatches = 0;
    let started = Instant::now();
    for index in 0..pixels {
        if image.get_index(index)? != T::pattern(index) {
            mismatches += 1;
        }
    }
    let sequential_verify_ms = started.elapsed().as_millis();

    let mut rng = StdRng::seed_from_u64(cli.seed);
    let started = Instant::now();
    for _ in 0..cli.random_reads {
        let index = rng.gen_range(0..pixels);
        if image.get_index(index)? != T::pattern(index) {
            mismatches += 1;
        }
    }
    let random_verify_ms = started.elapsed().as_millis();

    let report = BenchReport {
        element: cli.element,
        dims,
        page_size: image.page_size(),
        page_count: image.page_count(),
        pixels,
        write_ms,
        sequential_verify_ms,
        random_verify_ms,
        mismatches,
        cache: manager.stats(),
        image: image.stats(),
    };
    image.close()?;
    Ok(report)
}

fn print_text(report: &BenchReport) {
    println!("Image:");
    println!(
        "  element={:?} pixels={} page_size={} page_count={}",
        report.element, report.pixels, report.page_size, report.page_count
    );
    println!(
        "  loads={} stores={} discards={} resident_pages={}",
        report.image.loads, report.image.stores, report.image.discards, report.image.resident_pages
    );
    println!();
    println!("Cache:");
    println!("  {}", report.cache);
    println!(
        "  eviction_signals={} backpressure_waits={} backpressure_timeouts={}",
        report.cache.eviction_signals,
        report.cache.backpressure_waits,
        report.cache.backpressure_timeouts
    );
    println!();
    println!(
        "Timing: write_ms={} sequential_verify_ms={} random_verify_ms={}",
        report.write_ms, report.sequential_verify_ms, report.random_verify_ms
    );
    println!("Mismatches: {}", report.mismatches);
}
