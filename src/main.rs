//! Main entry point for the iFocal CLI

#![forbid(unsafe_code)]

use clap::Parser;
use dotenvy::dotenv;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ifocal::cli::commands::{self, Commands, GlobalOptions};

/// iFocal - rate-limited batch translation service
#[derive(Parser, Debug)]
#[command(name = "ifocal", version, about, long_about = None)]
struct Args {
    /// Configuration file (YAML, TOML or JSON); IFOCAL__* env vars override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Override tx_qps for this process
    #[arg(long)]
    qps: Option<u32>,

    /// Override tx_max_concurrent for this process
    #[arg(long)]
    max_concurrent: Option<u32>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}={}", env!("CARGO_PKG_NAME"), log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let options = GlobalOptions {
        config: args.config,
        qps: args.qps,
        max_concurrent: args.max_concurrent,
    };

    // Execute command
    match args.command {
        Some(Commands::Serve { host, port }) => {
            commands::handle_serve(&options, host, port).await?;
        }
        Some(Commands::Translate {
            text,
            task,
            target_lang,
            model,
        }) => {
            commands::handle_translate(&options, text, task, target_lang, model).await?;
        }
        Some(Commands::Page {
            file,
            output,
            target_lang,
            recursive,
        }) => {
            commands::handle_page(&options, file, output, target_lang, recursive).await?;
        }
        Some(Commands::TestChannel { channel, model }) => {
            commands::handle_test_channel(&options, channel, model).await?;
        }
        Some(Commands::RateStatus) => {
            commands::handle_rate_status(&options).await?;
        }
        Some(Commands::Config) => {
            commands::handle_config(&options).await?;
        }
        Some(Commands::Cache { action }) => {
            commands::handle_cache(&options, action).await?;
        }
        None => {
            println!("Please specify a command. Use --help for more information.");
        }
    }

    Ok(())
}
