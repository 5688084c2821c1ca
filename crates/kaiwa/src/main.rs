//! kaiwa: Slack assistant bot that relays conversations to Gemini on Vertex AI.

mod bootstrap_helpers;
mod server;
mod startup;

use anyhow::Result;
use clap::Parser;
use kaiwa_cli::Cli;

use crate::bootstrap_helpers::init_tracing;
use crate::startup::run_cli;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    run_cli(cli).await
}
