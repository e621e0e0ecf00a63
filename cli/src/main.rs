//! logicctl - command-line interface for the logic-analyzer workbench
//!
//! # Usage
//! ```bash
//! logicctl scan                      # list raw detected devices
//! logicctl detect                    # list devices with matched drivers
//! logicctl connect --port /dev/ttyACM0
//! logicctl capture -o capture.json   # run a capture on the current device
//! logicctl decode -i capture.json --decoder i2c
//! ```

use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;

mod commands;

/// logicctl - host-side workbench for a USB/serial/network logic analyzer
#[derive(Parser)]
#[command(name = "logicctl")]
#[command(author = "LogicBench Team")]
#[command(version = "0.1.0")]
#[command(about = "Command-line interface for capture and protocol decode")]
#[command(long_about = None)]
pub struct Cli {
    /// Output format (text, json)
    #[arg(short = 'f', long, default_value = "text", global = true)]
    pub format: String,

    /// Verbose output (also settable via RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Device port or connection string (auto-detect if not specified)
    #[arg(short = 'p', long, global = true)]
    pub port: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List raw detected devices (no driver matching)
    Scan,

    /// Detect devices and show which driver would handle each
    Detect,

    /// Connect to a device (auto-detects if --port is not given)
    Connect,

    /// Run a capture on the currently reachable device
    Capture {
        /// Output file for the captured session (JSON)
        #[arg(short, long)]
        output: PathBuf,

        /// Sample frequency in Hz
        #[arg(long, default_value_t = 1_000_000)]
        frequency: u32,

        /// Pre-trigger sample count
        #[arg(long, default_value_t = 1_000)]
        pre: u32,

        /// Post-trigger sample count
        #[arg(long, default_value_t = 9_000)]
        post: u32,

        /// Number of channels to capture (1-24)
        #[arg(long, default_value_t = 8)]
        channels: u8,
    },

    /// Decode a previously captured session
    Decode {
        /// Input capture file (JSON, as written by `capture`)
        #[arg(short, long)]
        input: PathBuf,

        /// Decoder id: i2c, spi, or uart
        #[arg(long)]
        decoder: String,

        /// Channel mapping entries, e.g. SCL=0 SDA=1
        #[arg(long = "map", value_parser = parse_key_val)]
        mapping: Vec<(String, usize)>,

        /// Decoder option entries, e.g. address_format=shifted
        #[arg(long = "opt", value_parser = parse_key_val_str)]
        options: Vec<(String, String)>,

        /// Decode via the chunked streaming path instead of batch
        #[arg(long)]
        streaming: bool,

        /// Streaming chunk size in samples
        #[arg(long)]
        chunk_size: Option<usize>,
    },

    /// Device registry operations
    Devices {
        #[command(subcommand)]
        action: DevicesAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum DevicesAction {
    /// List registered driver kinds
    List,
    /// Register a network-transport driver alias for a custom device tag
    Register {
        /// Unique registration id
        id: String,
        /// Human-readable name
        name: String,
        /// Substrings matched against a detected device's id/name
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Match priority (higher wins ties)
        #[arg(long, default_value_t = 40)]
        priority: u8,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the current configuration
    Show,
    /// Set a configuration value
    Set { key: String, value: String },
    /// Reset configuration to defaults
    Reset,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    install_logging(&cli);

    if !cli.quiet {
        print_banner();
    }

    let result = match &cli.command {
        Commands::Scan => commands::scan(&cli).await,
        Commands::Detect => commands::detect(&cli).await,
        Commands::Connect => commands::connect(&cli).await,
        Commands::Capture { output, frequency, pre, post, channels } => {
            commands::capture(&cli, output, *frequency, *pre, *post, *channels).await
        }
        Commands::Decode { input, decoder, mapping, options, streaming, chunk_size } => {
            commands::decode(&cli, input, decoder, mapping, options, *streaming, *chunk_size)
        }
        Commands::Devices { action } => match action {
            DevicesAction::List => commands::devices_list(&cli),
            DevicesAction::Register { id, name, tags, priority } => {
                commands::devices_register(&cli, id, name, tags, *priority)
            }
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_show(&cli),
            ConfigAction::Set { key, value } => commands::config_set(&cli, key, value),
            ConfigAction::Reset => commands::config_reset(&cli),
        },
    };

    if let Err(e) = result {
        if !cli.quiet {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
        }
        std::process::exit(1);
    }
}

fn install_logging(cli: &Cli) {
    let filter = if cli.verbose {
        "logicbench_core=debug,logicctl=debug".to_string()
    } else {
        std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string())
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .try_init();
}

fn print_banner() {
    println!(
        "{}",
        r#"
  _             _      ____                  _
 | |   ___ __ _(_) ___| __ )  ___ _ __   ___| |__
 | |  / _ \ / _` | |/ __|  _ \ / _ \ '_ \ / __| '_ \
 | |_| (_) | (_| | | (__| |_) |  __/ | | | (__| | | |
 |_____\___/ \__, |_|\___|____/ \___|_| |_|\___|_| |_|
             |___/          logic analyzer workbench
"#
        .cyan()
    );
}

/// Create a progress bar matching the workbench's capture-progress style.
pub fn create_progress_bar(total: u64, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("█▓▒░"),
    );
    pb.set_message(message.to_string());
    pb
}

fn parse_key_val(s: &str) -> Result<(String, usize), String> {
    let (k, v) = s.split_once('=').ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))?;
    let parsed = v.parse::<usize>().map_err(|e| e.to_string())?;
    Ok((k.to_string(), parsed))
}

fn parse_key_val_str(s: &str) -> Result<(String, String), String> {
    let (k, v) = s.split_once('=').ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))?;
    Ok((k.to_string(), v.to_string()))
}
