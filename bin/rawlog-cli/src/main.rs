//! rawlog CLI - Log device administration
//!
//! This binary formats log devices and inspects their index and content.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rawlog_common::EngineConfig;
use rawlog_storage::{BootstrapMode, LogDevice};
use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Bytes read per request by `cat`
const CAT_CHUNK: usize = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "rawlog-cli")]
#[command(about = "rawlog log device administration")]
#[command(version)]
struct Args {
    /// Log device or file
    #[arg(short, long, env = "RAWLOG_DEVICE")]
    device: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Format the device, discarding all logs
    Format,
    /// Show device geometry and usage
    Info,
    /// List live logs
    List,
    /// Dump every used descriptor slot
    Segments,
    /// Write the content of a log to stdout
    Cat {
        /// Log name
        name: String,
        /// Logical start position
        #[arg(long, default_value = "0")]
        pos: u64,
        /// Bytes to read (default: up to the log length)
        #[arg(long)]
        length: Option<u64>,
    },
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    engine: EngineConfig,
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("failed to parse config file {}", path.display()))
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(args.config.as_deref())?.engine;
    let mode = match args.command {
        Commands::Format => BootstrapMode::Format,
        _ => BootstrapMode::Existing,
    };
    let device = LogDevice::bootstrap(&args.device, mode, config)
        .with_context(|| format!("failed to bootstrap {}", args.device.display()))?;

    match args.command {
        Commands::Format => {
            info!("formatted {}", device.path());
            print_info(&device);
        }
        Commands::Info => print_info(&device),
        Commands::List => print!("{}", device.list_files()),
        Commands::Segments => print_segments(&device),
        Commands::Cat { name, pos, length } => cat(&device, &name, pos, length)?,
    }

    Ok(())
}

fn print_info(device: &LogDevice) {
    let header = device.header();
    println!("Device: {}", device.path());
    println!("=======");
    println!("Format version:   {}", header.version);
    println!("Length:           {} bytes", header.device_length);
    println!("Block size:       {}", header.block_size);
    println!("Growth unit:      {}", header.growth_unit);
    println!(
        "Index:            {} slots at {} ({} per block)",
        header.index_length, header.index_start, header.descriptors_per_block
    );
    println!("Data start:       {}", header.data_start);
    println!("Slots used:       {}", device.segments().len());
    println!("Live logs:        {}", device.list_files().lines().count());
    println!(
        "Free space:       {} of {} bytes",
        device.free_space(),
        header.data_capacity()
    );
}

fn print_segments(device: &LogDevice) {
    println!(
        "{:>6} {:<9} {:<8} {:>14} {:>12} {:>12} {:>6} {:>6}  NAME",
        "SLOT", "TYPE", "STATUS", "BEGIN", "PART", "LENGTH", "NEXT", "FIRST"
    );
    for segment in device.segments() {
        let d = &segment.descriptor;
        let status = if d.status.is_deleted() {
            "deleted"
        } else if d.status.is_open() {
            "open"
        } else {
            "closed"
        };
        let next = d.next.map_or_else(|| "-".to_string(), |n| n.to_string());
        println!(
            "{:>6} {:<9} {:<8} {:>14} {:>12} {:>12} {:>6} {:>6}  {}",
            segment.slot,
            d.log_type,
            status,
            d.begin,
            d.part_length,
            d.cur_length,
            next,
            d.first,
            d.name
        );
    }
}

fn cat(device: &LogDevice, name: &str, pos: u64, length: Option<u64>) -> Result<()> {
    let Some(handle) = device.find(name) else {
        bail!("no log named {name}");
    };
    let end = match length {
        Some(length) => pos
            .checked_add(length)
            .with_context(|| format!("range {pos}+{length} is not addressable"))?,
        None => device.length(handle)?,
    };

    let mut stdout = std::io::stdout().lock();
    let mut buf = vec![0u8; CAT_CHUNK];
    let mut at = pos;
    while at < end {
        let len = (end - at).min(CAT_CHUNK as u64) as usize;
        device
            .read(handle, &mut buf, 0, len, at)
            .with_context(|| format!("failed to read {name} at {at}"))?;
        stdout.write_all(&buf[..len])?;
        at += len as u64;
    }
    stdout.flush()?;
    Ok(())
}
