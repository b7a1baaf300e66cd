mod cli;
mod commands;
mod output;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve => commands::serve().await,
        Command::Doctor { json } => commands::doctor(json).await,
        Command::Watchdog { threshold_minutes, action, dry_run, lab_id } => {
            commands::watchdog(threshold_minutes, action, dry_run, lab_id).await
        }
        Command::Smoke { keep_on_success, json } => commands::smoke(keep_on_success, json).await,
    }
}
