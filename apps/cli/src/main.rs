//! Lexiforge CLI: generate, review and publish vocabulary dictionaries.
//!
//! Dictionaries are generated by an AI text service, staged locally, then
//! reviewed and promoted into the public catalog as change events arrive.

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
