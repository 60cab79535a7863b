//! StoryCrew CLI: run story pipelines locally or through a durable queue.
//!
//! Submits architect and director jobs, polls their status, and runs
//! queue workers that execute jobs submitted by other processes.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
