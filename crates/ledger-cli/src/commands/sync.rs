use std::time::Duration;

use ledger_core::{Ledger, Table};

use crate::cli::KeepSide;
use crate::commands::common::{
    format_conflict_lines, format_report_lines, format_status_lines, parse_id, print_json,
};
use crate::error::CliError;

pub async fn run_sync(ledger: &Ledger, watch: Option<u64>, as_json: bool) -> Result<(), CliError> {
    if let Some(seconds) = watch {
        let periodic = ledger.spawn_periodic_sync(Duration::from_secs(seconds.max(1)));
        println!("Syncing every {}s, press Ctrl-C to stop", seconds.max(1));
        tokio::signal::ctrl_c().await?;
        periodic.stop().await;
        return Ok(());
    }

    let report = ledger.engine().sync_all().await;
    if as_json {
        return print_json(&report);
    }
    for line in format_report_lines(&report) {
        println!("{line}");
    }
    if report.total_conflicts() > 0 {
        println!("Run `ledger conflicts` to review records that need resolution.");
    }
    Ok(())
}

pub async fn run_status(ledger: &Ledger, as_json: bool) -> Result<(), CliError> {
    let statuses = ledger.service().status().await?;
    if as_json {
        return print_json(&statuses);
    }
    for line in format_status_lines(&statuses) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_conflicts(ledger: &Ledger, as_json: bool) -> Result<(), CliError> {
    let conflicts = ledger.service().conflicts().await?;
    if as_json {
        return print_json(&conflicts);
    }
    if conflicts.is_empty() {
        println!("No sync conflicts.");
        return Ok(());
    }
    for line in format_conflict_lines(&conflicts, chrono::Utc::now().timestamp_millis()) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_resolve(
    ledger: &Ledger,
    table: &str,
    id: &str,
    keep: KeepSide,
) -> Result<(), CliError> {
    let table: Table = table.trim().parse()?;
    let id = parse_id(id)?;
    let remaining = ledger.service().resolve(table, id, keep.into()).await?;
    if remaining {
        println!("Resolved {table}/{id}");
    } else {
        println!("Resolved {table}/{id}; the record no longer exists remotely");
    }
    Ok(())
}

pub async fn run_currencies(ledger: &Ledger, as_json: bool) -> Result<(), CliError> {
    let currencies = ledger.service().list_currencies().await?;
    if as_json {
        return print_json(&currencies);
    }
    for currency in currencies {
        println!(
            "{}  {:<3} {} ({} decimals)",
            currency.code, currency.symbol, currency.name, currency.decimals
        );
    }
    Ok(())
}

pub async fn run_reset(ledger: &Ledger, confirmed: bool) -> Result<(), CliError> {
    if !confirmed {
        return Err(CliError::ResetNotConfirmed);
    }
    ledger.service().wait_idle().await;
    ledger.store().reset().await?;
    println!("Local database removed; run `ledger sync` to download your data again");
    Ok(())
}
