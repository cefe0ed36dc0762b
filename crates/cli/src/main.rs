//! TraceTriage CLI - Main Entry Point
//!
//! Runs the failure-analysis pipeline against local artifact files and
//! prints the diagnosis.

use clap::{Parser, Subcommand};

mod commands;
mod output;

use commands::{analyze, summary};

/// TraceTriage - browser-test failure analysis
#[derive(Parser)]
#[command(name = "triage")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Output format
    #[arg(long, value_enum, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze one test run's artifacts
    Analyze(analyze::AnalyzeArgs),

    /// Print pass/fail counts for a report
    Summary(summary::SummaryArgs),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Analyze(args) => analyze::run(args, cli.format).await,
        Commands::Summary(args) => summary::run(args, cli.format),
        Commands::Version => {
            println!("triage {}", triage_common::VERSION);
            Ok(())
        }
    }
}
