use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use tracing::{info, Level};

use clipsave::cli::Cli;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse command line arguments; clap exits with 2 on usage errors
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("Starting clipsave v{}", env!("CARGO_PKG_VERSION"));

    let outcome = cli.run().await?;
    Ok(outcome.exit_code())
}
