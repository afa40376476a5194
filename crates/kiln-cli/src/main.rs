//! Kiln CLI - Command Line Interface for the Kiln engine cache
//!
//! Lists, inspects and purges cache directories, and simulates inference
//! traffic against a coordinator backed by a synthetic engine builder.

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use kiln_core::config::LogLevel;
use std::path::PathBuf;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

mod commands;
mod config;
mod utils;

use commands::{
    inspect::InspectCommand, list::ListCommand, purge::PurgeCommand, simulate::SimulateCommand,
    Command,
};

#[derive(Parser)]
#[command(
    name = "kiln",
    version = env!("CARGO_PKG_VERSION"),
    about = "Kiln engine cache CLI",
    long_about = "Inspect and maintain compiled engine and shape profile caches, and simulate inference traffic against them."
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Configuration file path
    #[arg(short, long, global = true, env = "KILN_CONFIG")]
    config: Option<PathBuf>,

    /// JSON output format
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List engine and profile files in the cache directory
    #[command(name = "list", alias = "ls")]
    List(ListCommand),

    /// Decode a profile file
    #[command(name = "inspect", alias = "i")]
    Inspect(InspectCommand),

    /// Delete cache files
    #[command(name = "purge")]
    Purge(PurgeCommand),

    /// Run input shapes through the cache with a synthetic builder
    #[command(name = "simulate", alias = "sim")]
    Simulate(SimulateCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::Config::load(cli.config.as_deref())?;

    // Initialize logging
    init_logging(&cli, config.cache.logging.level)?;

    debug!("Kiln CLI v{} starting", env!("CARGO_PKG_VERSION"));
    debug!("Configuration loaded: {:?}", config);

    let result = match cli.command {
        Commands::List(cmd) => cmd.execute(&config, cli.json).await,
        Commands::Inspect(cmd) => cmd.execute(&config, cli.json).await,
        Commands::Purge(cmd) => cmd.execute(&config, cli.json).await,
        Commands::Simulate(cmd) => cmd.execute(&config, cli.json).await,
    };

    match result {
        Ok(_) => {
            if !cli.quiet {
                info!("Command completed successfully");
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {:#}", style("Error:").red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn init_logging(cli: &Cli, configured: LogLevel) -> Result<()> {
    let level = if cli.debug {
        Level::DEBUG
    } else if cli.verbose {
        Level::INFO
    } else if cli.quiet {
        Level::ERROR
    } else {
        match configured {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
