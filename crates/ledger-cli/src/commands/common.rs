use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use ledger_core::sync::TableStatus;
use ledger_core::{
    Account, Category, Currency, EntityId, InboxItem, Ledger, LedgerConfig, SyncConflict,
    SyncReport, Transaction,
};
use serde::Serialize;

use crate::error::CliError;

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ledger")
        .join("ledger.db")
}

/// File config (when given) plus `LEDGER_*` overrides. The local database
/// is always file-backed here: `--db-path`, then config, then the data dir.
pub fn load_config(
    config_path: Option<&Path>,
    db_path: Option<PathBuf>,
) -> Result<LedgerConfig, CliError> {
    let mut config = match config_path {
        Some(path) => LedgerConfig::load(path)?,
        None => LedgerConfig::from_env()?,
    };
    config.db_path = Some(
        db_path
            .or_else(|| config.db_path.take())
            .unwrap_or_else(default_db_path),
    );
    Ok(config)
}

pub fn open_ledger(config: &LedgerConfig) -> Result<Ledger, CliError> {
    if let Some(parent) = config.db_path.as_deref().and_then(Path::parent) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Ledger::from_config(config)?)
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn parse_id(raw: &str) -> Result<EntityId, CliError> {
    raw.trim()
        .parse()
        .map_err(|_| CliError::InvalidId(raw.to_string()))
}

pub fn parse_optional_id(raw: Option<&str>) -> Result<Option<EntityId>, CliError> {
    raw.map(parse_id).transpose()
}

pub fn normalize_description(parts: &[String]) -> Result<String, CliError> {
    let joined = parts.join(" ");
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyDescription)
    } else {
        Ok(trimmed.to_string())
    }
}

/// Parse a major-unit amount like `-12.50` into minor units
pub fn parse_amount(raw: &str, decimals: u8) -> Result<i64, CliError> {
    let invalid = || CliError::InvalidAmount(raw.to_string());
    let trimmed = raw.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));

    let all_digits = |part: &str| part.chars().all(|c| c.is_ascii_digit());
    if (whole.is_empty() && fraction.is_empty())
        || fraction.len() > usize::from(decimals)
        || !all_digits(whole)
        || !all_digits(fraction)
    {
        return Err(invalid());
    }

    let scale = 10_i64.checked_pow(u32::from(decimals)).ok_or_else(invalid)?;
    let whole: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let fraction: i64 = if fraction.is_empty() {
        0
    } else {
        format!("{fraction:0<width$}", width = usize::from(decimals))
            .parse()
            .map_err(|_| invalid())?
    };

    let minor = whole
        .checked_mul(scale)
        .and_then(|value| value.checked_add(fraction))
        .ok_or_else(invalid)?;
    Ok(if negative { -minor } else { minor })
}

/// Currency reference data, or a two-decimal stand-in when it is unknown
pub async fn currency_for(ledger: &Ledger, code: &str) -> Currency {
    let known = match ledger.service().list_currencies().await {
        Ok(currencies) => currencies,
        Err(error) => {
            tracing::debug!("Currency list unavailable: {error}");
            Vec::new()
        }
    };
    find_currency(&known, code)
}

pub fn find_currency(currencies: &[Currency], code: &str) -> Currency {
    currencies
        .iter()
        .find(|currency| currency.code == code)
        .cloned()
        .unwrap_or_else(|| Currency {
            code: code.to_string(),
            name: code.to_string(),
            symbol: String::new(),
            decimals: 2,
        })
}

pub fn format_money(currencies: &[Currency], code: &str, amount: i64) -> String {
    let currency = find_currency(currencies, code);
    format!("{} {}", currency.format_minor(amount), currency.code)
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

pub fn format_date(timestamp_ms: i64) -> String {
    Utc.timestamp_millis_opt(timestamp_ms)
        .single()
        .map_or_else(|| timestamp_ms.to_string(), |time| time.format("%Y-%m-%d").to_string())
}

fn id_text(id: Option<EntityId>) -> String {
    id.map_or_else(|| "-".to_string(), |id| id.to_string())
}

pub fn format_account_lines(accounts: &[Account], currencies: &[Currency]) -> Vec<String> {
    accounts
        .iter()
        .map(|account| {
            let archived = if account.is_archived { " (archived)" } else { "" };
            format!(
                "{}  {:<20} {:<10} {}{archived}",
                id_text(account.meta.id),
                account.name,
                format!("{:?}", account.kind).to_lowercase(),
                format_money(currencies, &account.currency_code, account.balance_cents),
            )
        })
        .collect()
}

/// Top-level categories with their children indented underneath
pub fn format_category_lines(categories: &[Category]) -> Vec<String> {
    let mut children: BTreeMap<EntityId, Vec<&Category>> = BTreeMap::new();
    let mut roots = Vec::new();
    for category in categories {
        match category.parent_id {
            Some(parent) => children.entry(parent).or_default().push(category),
            None => roots.push(category),
        }
    }
    roots.sort_by(|a, b| a.name.cmp(&b.name));

    let line = |category: &Category, indent: &str| {
        format!(
            "{indent}{}  {} [{}]",
            id_text(category.meta.id),
            category.name,
            format!("{:?}", category.kind).to_lowercase()
        )
    };

    let mut lines = Vec::new();
    for root in roots {
        lines.push(line(root, ""));
        if let Some(mut nested) = root.meta.id.and_then(|id| children.remove(&id)) {
            nested.sort_by(|a, b| a.name.cmp(&b.name));
            lines.extend(nested.into_iter().map(|child| line(child, "  ")));
        }
    }
    // Children whose parent is not in the active list
    for orphan in children.into_values().flatten() {
        lines.push(line(orphan, "? "));
    }
    lines
}

pub fn format_transaction_lines(
    transactions: &[Transaction],
    currencies: &[Currency],
) -> Vec<String> {
    transactions
        .iter()
        .map(|transaction| {
            format!(
                "{}  {}  {:>16}  {}{}",
                id_text(transaction.meta.id),
                format_date(transaction.occurred_at),
                format_money(
                    currencies,
                    &transaction.currency_code,
                    transaction.amount_cents
                ),
                transaction.description,
                status_marker(transaction.meta.local_sync_status),
            )
        })
        .collect()
}

pub fn format_inbox_lines(items: &[InboxItem], now_ms: i64) -> Vec<String> {
    items
        .iter()
        .map(|item| {
            let amount = item
                .amount_cents
                .map_or_else(String::new, |amount| {
                    format!(" ({})", find_currency(&[], "").format_minor(amount))
                });
            format!(
                "{}  {}{amount}  {}",
                id_text(item.meta.id),
                item.description,
                format_relative_time(item.meta.created_at, now_ms)
            )
        })
        .collect()
}

fn status_marker(status: ledger_core::SyncStatus) -> &'static str {
    match status {
        ledger_core::SyncStatus::Synced => "",
        ledger_core::SyncStatus::Pending => "  *",
        ledger_core::SyncStatus::Conflict => "  !",
    }
}

pub fn format_status_lines(statuses: &[TableStatus]) -> Vec<String> {
    statuses
        .iter()
        .map(|status| {
            let last_sync = status
                .watermark
                .last_synced_at
                .map_or_else(|| "never".to_string(), format_date);
            format!(
                "{:<14} pending {:>3}  conflicts {:>3}  version {:>6}  last sync {last_sync}",
                status.table.name(),
                status.pending,
                status.conflicts,
                status.watermark.last_synced_version,
            )
        })
        .collect()
}

pub fn format_conflict_lines(conflicts: &[SyncConflict], now_ms: i64) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{} {}  local v{}  edited {}  {}",
                conflict.table.name(),
                conflict.entity_id,
                conflict.local_version,
                format_relative_time(conflict.updated_at, now_ms),
                conflict.reason.as_deref().unwrap_or("version conflict"),
            )
        })
        .collect()
}

pub fn format_report_lines(report: &SyncReport) -> Vec<String> {
    report
        .tables
        .iter()
        .map(|table| {
            let mut line = format!(
                "{:<14} pushed {:>3}  pulled {:>3}",
                table.table.name(),
                table.pushed.synced,
                table.pulled.applied
            );
            if table.pushed.conflicts > 0 {
                line.push_str(&format!("  conflicts {}", table.pushed.conflicts));
            }
            if table.pushed.failed > 0 {
                line.push_str(&format!("  queued {}", table.pushed.failed));
            }
            if let Some(error) = &table.error {
                line.push_str(&format!("  error: {error}"));
            }
            line
        })
        .collect()
}
