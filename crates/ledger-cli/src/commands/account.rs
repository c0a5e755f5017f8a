use ledger_core::Ledger;

use crate::cli::AccountCommands;
use crate::commands::common::{format_account_lines, parse_id, print_json};
use crate::error::CliError;

pub async fn run_account(
    command: AccountCommands,
    ledger: &Ledger,
    as_json: bool,
) -> Result<(), CliError> {
    let service = ledger.service();
    let changed = match command {
        AccountCommands::Add {
            name,
            kind,
            currency,
        } => service.create_account(&name, kind.into(), &currency).await?,
        AccountCommands::List => {
            let accounts = service.list_accounts().await?;
            if as_json {
                return print_json(&accounts);
            }
            if accounts.is_empty() {
                println!("No accounts yet.");
            }
            let currencies = service.list_currencies().await.unwrap_or_default();
            for line in format_account_lines(&accounts, &currencies) {
                println!("{line}");
            }
            return Ok(());
        }
        AccountCommands::Rename { id, name } => {
            service.rename_account(parse_id(&id)?, &name).await?
        }
        AccountCommands::Archive { id, undo } => {
            service.set_account_archived(parse_id(&id)?, !undo).await?
        }
        AccountCommands::Delete { id } => service.delete_account(parse_id(&id)?).await?,
    };

    if as_json {
        print_json(&changed)
    } else {
        println!("{}", changed.meta.id.map(|id| id.to_string()).unwrap_or_default());
        Ok(())
    }
}
