//! rust-mmu - batch address translation driver
//!
//! Usage: rust-mmu [OPTIONS] <INIT> <INPUT> <OUTPUT>
//!
//! The init file registers segments and seeds the disk and resident memory;
//! every line of the input file is a `<48-bit address> <length>` request, and
//! the output file gets one `<32-bit physical> <hex data>` or `-1 <error>`
//! line per request.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use rust_mmu::config::MmuConfig;
use rust_mmu::io::{InitData, format_result, read_requests, serve, write_results};
use rust_mmu::memory::Disk;
use rust_mmu::translation::AddressTranslator;

#[derive(Parser)]
#[command(name = "rust-mmu")]
#[command(about = "Translate logical addresses through segmentation and paging")]
#[command(version)]
struct Cli {
    /// Initialization file with segment, disk and memory directives
    init: PathBuf,

    /// Requests to translate, one per line
    input: PathBuf,

    /// Where to write one result line per request
    output: PathBuf,

    /// TOML file with mode flags and capacities
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log faults and a summary to stderr
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    run(&cli)
}

fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => MmuConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => MmuConfig::default(),
    };
    info!("mode {:?}, config {:?}", config.mode(), config);
    if config.paging {
        info!(
            "linear = {}-bit vpn | {}-bit offset, physical = {}-bit frame | {}-bit offset",
            config.vpn_bits(),
            config.page_bits(),
            config.frame_bits(),
            config.page_bits()
        );
    }

    let init = InitData::from_file(&cli.init)
        .with_context(|| format!("parsing init file {}", cli.init.display()))?;
    info!(
        "{} segment(s), {} disk fill(s), {} memory fill(s)",
        init.segments.len(),
        init.disk_fills.len(),
        init.memory_fills.len()
    );

    let mut disk = Disk::new(config.disk_size);
    init.apply_disk(&mut disk)?;
    info!("disk seeded: {} block(s) populated", disk.populated_blocks());
    let mut mmu = AddressTranslator::new(config, disk)?;
    init.apply(&mut mmu)?;

    let requests = read_requests(&cli.input)
        .with_context(|| format!("reading requests from {}", cli.input.display()))?;

    let mut failures = 0usize;
    let lines: Vec<String> = requests
        .iter()
        .map(|request| {
            let result = serve(&mut mmu, request);
            if let Err(err) = &result {
                warn!("line {}: {}", request.line, err);
                failures += 1;
            }
            format_result(&result)
        })
        .collect();

    write_results(&cli.output, &lines)
        .with_context(|| format!("writing results to {}", cli.output.display()))?;

    let stats = mmu.stats();
    info!(
        "{} request(s), {} failed; faults: {} segment, {} page; evictions: {} segment, {} page; {} compaction(s), {} bytes loaded",
        requests.len(),
        failures,
        stats.segment_faults,
        stats.page_faults,
        stats.segment_evictions,
        stats.page_evictions,
        stats.compactions,
        stats.bytes_loaded
    );
    Ok(())
}
