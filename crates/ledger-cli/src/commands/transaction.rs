use ledger_core::Ledger;

use crate::cli::TransactionCommands;
use crate::commands::common::{
    currency_for, format_transaction_lines, normalize_description, parse_amount, parse_id,
    parse_optional_id, print_json,
};
use crate::error::CliError;

pub async fn run_transaction(
    command: TransactionCommands,
    ledger: &Ledger,
    as_json: bool,
) -> Result<(), CliError> {
    let service = ledger.service();
    let changed = match command {
        TransactionCommands::Add {
            account,
            amount,
            description,
            category,
        } => {
            let account_id = parse_id(&account)?;
            let account = service
                .get_account(account_id)
                .await?
                .ok_or_else(|| CliError::NotFound(format!("account {account_id}")))?;
            let currency = currency_for(ledger, &account.currency_code).await;
            let amount = parse_amount(&amount, currency.decimals)?;
            let description = normalize_description(&description)?;
            let category = parse_optional_id(category.as_deref())?;
            service
                .record_transaction(account_id, amount, &description, category)
                .await?
        }
        TransactionCommands::List {
            account,
            category,
            limit,
        } => {
            let mut transactions = match (
                parse_optional_id(account.as_deref())?,
                parse_optional_id(category.as_deref())?,
            ) {
                (Some(account), category) => {
                    let mut listed = service.transactions_for_account(account).await?;
                    if let Some(category) = category {
                        listed.retain(|transaction| transaction.category_id == Some(category));
                    }
                    listed
                }
                (None, Some(category)) => service.transactions_in_category(category).await?,
                (None, None) => service.list_transactions().await?,
            };
            transactions.sort_by_key(|transaction| std::cmp::Reverse(transaction.occurred_at));
            transactions.truncate(limit);

            if as_json {
                return print_json(&transactions);
            }
            if transactions.is_empty() {
                println!("No transactions.");
            }
            let currencies = service.list_currencies().await.unwrap_or_default();
            for line in format_transaction_lines(&transactions, &currencies) {
                println!("{line}");
            }
            return Ok(());
        }
        TransactionCommands::Categorize { id, category } => {
            let category = parse_optional_id(category.as_deref())?;
            service
                .recategorize_transaction(parse_id(&id)?, category)
                .await?
        }
        TransactionCommands::Delete { id } => service.delete_transaction(parse_id(&id)?).await?,
    };

    if as_json {
        print_json(&changed)
    } else {
        println!("{}", changed.meta.id.map(|id| id.to_string()).unwrap_or_default());
        Ok(())
    }
}
