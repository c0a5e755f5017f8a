//! Ledger CLI - Offline-first personal finance from the command line
//!
//! Every command works against the local database; `ledger sync` exchanges
//! queued edits and remote changes with the configured backend.

mod cli;
mod commands;
mod error;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::commands::account::run_account;
use crate::commands::category::run_category;
use crate::commands::common::{load_config, open_ledger};
use crate::commands::inbox::run_inbox;
use crate::commands::sync::{
    run_conflicts, run_currencies, run_reset, run_resolve, run_status, run_sync,
};
use crate::commands::transaction::run_transaction;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ledger=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.db_path)?;
    let ledger = open_ledger(&config)?;
    let json = cli.json;

    let result = match cli.command {
        Commands::Account { command } => run_account(command, &ledger, json).await,
        Commands::Category { command } => run_category(command, &ledger, json).await,
        Commands::Transaction { command } => run_transaction(command, &ledger, json).await,
        Commands::Inbox { command } => run_inbox(command, &ledger, json).await,
        Commands::Currencies => run_currencies(&ledger, json).await,
        Commands::Sync { watch } => run_sync(&ledger, watch, json).await,
        Commands::Status => run_status(&ledger, json).await,
        Commands::Conflicts => run_conflicts(&ledger, json).await,
        Commands::Resolve { table, id, keep } => run_resolve(&ledger, &table, &id, keep).await,
        Commands::Reset { yes } => run_reset(&ledger, yes).await,
    };

    // Background pushes started by the command finish before exit
    ledger.shutdown().await;
    result
}
