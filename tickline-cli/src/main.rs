use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use tickline_config::load_config;
use tickline_telemetry::init_tracing;

mod app;

use app::Stage;

#[derive(Parser)]
#[command(author, version, about = "Tickline market-tick processing pipeline")]
struct Cli {
    /// Increases logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the feed ingestors
    Ingest,
    /// Run the raw-event normalizer
    Normalize,
    /// Run the latest-quote publisher
    Publish,
    /// Run the anomaly detector
    Detect,
    /// Run every pipeline stage in one process
    All,
}

impl From<&Commands> for Stage {
    fn from(command: &Commands) -> Self {
        match command {
            Commands::Ingest => Stage::Ingest,
            Commands::Normalize => Stage::Normalize,
            Commands::Publish => Stage::Publish,
            Commands::Detect => Stage::Detect,
            Commands::All => Stage::All,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config().context("failed to load configuration")?;

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| match cli.verbose {
        0 => config.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    });
    init_tracing(&filter, None).context("failed to initialize logging")?;

    app::run(Stage::from(&cli.command), config).await
}
