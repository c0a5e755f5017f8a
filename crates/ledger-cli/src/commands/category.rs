use ledger_core::Ledger;

use crate::cli::CategoryCommands;
use crate::commands::common::{format_category_lines, parse_id, parse_optional_id, print_json};
use crate::error::CliError;

pub async fn run_category(
    command: CategoryCommands,
    ledger: &Ledger,
    as_json: bool,
) -> Result<(), CliError> {
    let service = ledger.service();
    let changed = match command {
        CategoryCommands::Add { name, kind, parent } => {
            let parent = parse_optional_id(parent.as_deref())?;
            service.create_category(&name, kind.into(), parent).await?
        }
        CategoryCommands::List => {
            let categories = service.list_categories().await?;
            if as_json {
                return print_json(&categories);
            }
            if categories.is_empty() {
                println!("No categories yet.");
            }
            for line in format_category_lines(&categories) {
                println!("{line}");
            }
            return Ok(());
        }
        CategoryCommands::Rename { id, name } => {
            service.rename_category(parse_id(&id)?, &name).await?
        }
        CategoryCommands::Move { id, parent } => {
            let parent = parse_optional_id(parent.as_deref())?;
            service.move_category(parse_id(&id)?, parent).await?
        }
        CategoryCommands::Delete { id } => service.delete_category(parse_id(&id)?).await?,
        CategoryCommands::Merge { target, sources } => {
            let target = parse_id(&target)?;
            let sources = sources
                .iter()
                .map(|source| parse_id(source))
                .collect::<Result<Vec<_>, _>>()?;
            let summary = service.merge_categories(&sources, target).await?;
            if as_json {
                return print_json(&summary);
            }
            println!(
                "Merged {} categories, {} records moved",
                summary.merged, summary.reassigned
            );
            return Ok(());
        }
    };

    if as_json {
        print_json(&changed)
    } else {
        println!("{}", changed.meta.id.map(|id| id.to_string()).unwrap_or_default());
        Ok(())
    }
}
