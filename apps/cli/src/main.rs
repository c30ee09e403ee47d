//! dlsession CLI - download session service
//!
//! `serve` exposes the session core as a JSON-lines method channel on stdio.
//! `get` drives downloads in-process and shows their progress.

mod commands;
mod output;
mod progress;
mod serve;
mod settings;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dlsession_core::{DownloadService, SimulatedEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// dlsession - download session coordinator
#[derive(Parser)]
#[command(name = "dlsession")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// JSON config file
    #[arg(long, env = "DLSESSION_CONFIG")]
    config: Option<PathBuf>,

    /// Upper bound for one dispatched command, in milliseconds
    #[arg(long, env = "DLSESSION_COMMAND_TIMEOUT_MS")]
    command_timeout_ms: Option<u64>,

    /// Upper bound for one engine call, in milliseconds
    #[arg(long, env = "DLSESSION_ENGINE_TIMEOUT_MS")]
    engine_timeout_ms: Option<u64>,

    /// Evict finished downloads after this many seconds
    #[arg(long, env = "DLSESSION_RETENTION_SECS")]
    retention_secs: Option<u64>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the method channel on stdin/stdout
    Serve,

    /// Download URLs and wait for them to finish
    Get {
        /// URLs to download
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Show the effective configuration
    Config,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Stdout belongs to the method channel and progress bars
    let default_level = match (&cli.command, cli.verbose) {
        (_, true) => "debug",
        (Commands::Serve, false) => "info",
        _ => "warn",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut settings = settings::AppConfig::load(cli.config.as_deref()).await?;
    if let Some(ms) = cli.command_timeout_ms {
        settings.core.command_timeout_ms = ms;
    }
    if let Some(ms) = cli.engine_timeout_ms {
        settings.core.engine_timeout_ms = ms;
    }
    if cli.retention_secs.is_some() {
        settings.core.terminal_retention_secs = cli.retention_secs;
    }

    match cli.command {
        Commands::Config => output::print_output(&settings, cli.output)?,

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "dlsession", &mut std::io::stdout());
        }

        Commands::Serve => {
            let service = start_service(&settings).await?;
            serve::run(service).await?;
        }

        Commands::Get { urls } => {
            let service = start_service(&settings).await?;
            let result = commands::get(&service, urls, cli.output).await;
            service.stop().await;
            result?;
        }
    }

    Ok(())
}

async fn start_service(settings: &settings::AppConfig) -> Result<DownloadService> {
    let engine = Arc::new(SimulatedEngine::new(settings.simulated.clone()));
    Ok(DownloadService::new(settings.core.clone(), engine).await?)
}
