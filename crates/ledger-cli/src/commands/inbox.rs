use ledger_core::Ledger;

use crate::cli::InboxCommands;
use crate::commands::common::{
    format_inbox_lines, normalize_description, parse_amount, parse_id, parse_optional_id,
    print_json,
};
use crate::error::CliError;

pub async fn run_inbox(
    command: InboxCommands,
    ledger: &Ledger,
    as_json: bool,
) -> Result<(), CliError> {
    let service = ledger.service();
    match command {
        InboxCommands::Add {
            description,
            amount,
        } => {
            let description = normalize_description(&description)?;
            let amount = amount.as_deref().map(|raw| parse_amount(raw, 2)).transpose()?;
            let item = service.capture(&description, amount).await?;
            if as_json {
                return print_json(&item);
            }
            println!("{}", item.meta.id.map(|id| id.to_string()).unwrap_or_default());
        }
        InboxCommands::List => {
            let items = service.list_inbox().await?;
            if as_json {
                return print_json(&items);
            }
            if items.is_empty() {
                println!("Inbox is empty.");
            }
            for line in format_inbox_lines(&items, chrono::Utc::now().timestamp_millis()) {
                println!("{line}");
            }
        }
        InboxCommands::Process {
            id,
            account,
            category,
        } => {
            let transaction = service
                .process_inbox_item(
                    parse_id(&id)?,
                    parse_id(&account)?,
                    parse_optional_id(category.as_deref())?,
                )
                .await?;
            if as_json {
                return print_json(&transaction);
            }
            println!(
                "{}",
                transaction.meta.id.map(|id| id.to_string()).unwrap_or_default()
            );
        }
        InboxCommands::Dismiss { id } => {
            let item = service.dismiss_inbox_item(parse_id(&id)?).await?;
            if as_json {
                return print_json(&item);
            }
            println!("Dismissed {}", item.description);
        }
    }
    Ok(())
}
