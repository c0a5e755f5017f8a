use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use ledger_core::{AccountKind, CategoryKind, Resolution};

#[derive(Parser)]
#[command(name = "ledger")]
#[command(about = "Offline-first personal finance ledger")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// JSON config file (LEDGER_* environment variables still apply)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage accounts
    Account {
        #[command(subcommand)]
        command: AccountCommands,
    },
    /// Manage categories
    Category {
        #[command(subcommand)]
        command: CategoryCommands,
    },
    /// Record and browse transactions
    #[command(alias = "tx")]
    Transaction {
        #[command(subcommand)]
        command: TransactionCommands,
    },
    /// Quick capture and triage
    Inbox {
        #[command(subcommand)]
        command: InboxCommands,
    },
    /// List known currencies
    Currencies,
    /// Push queued edits and pull remote changes
    Sync {
        /// Keep syncing every N seconds until interrupted
        #[arg(long, value_name = "SECONDS")]
        watch: Option<u64>,
    },
    /// Show queued edits, conflicts and watermarks per table
    Status,
    /// List records waiting for conflict resolution
    Conflicts,
    /// Resolve a record parked in conflict
    Resolve {
        /// Table name, e.g. categories
        table: String,
        /// Record id
        id: String,
        /// Which side wins
        #[arg(long, value_enum)]
        keep: KeepSide,
    },
    /// Delete the local database; the next command starts from scratch
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
pub enum AccountCommands {
    /// Create an account
    Add {
        name: String,
        #[arg(long, value_enum, default_value_t = AccountKindArg::Checking)]
        kind: AccountKindArg,
        /// ISO 4217 currency code
        #[arg(long, default_value = "USD")]
        currency: String,
    },
    /// List active accounts
    List,
    Rename {
        id: String,
        name: String,
    },
    /// Archive (or with --undo, unarchive) an account
    Archive {
        id: String,
        #[arg(long)]
        undo: bool,
    },
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
pub enum CategoryCommands {
    /// Create a category, optionally under a top-level parent
    Add {
        name: String,
        #[arg(long, value_enum, default_value_t = CategoryKindArg::Expense)]
        kind: CategoryKindArg,
        #[arg(long, value_name = "ID")]
        parent: Option<String>,
    },
    /// List active categories as a tree
    List,
    Rename {
        id: String,
        name: String,
    },
    /// Move under another parent, or to the top level without --parent
    Move {
        id: String,
        #[arg(long, value_name = "ID")]
        parent: Option<String>,
    },
    Delete {
        id: String,
    },
    /// Fold categories into a target in one server-side step
    Merge {
        /// Category that survives
        target: String,
        /// Categories merged away
        #[arg(required = true)]
        sources: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum TransactionCommands {
    /// Record a transaction; negative amounts are outflows
    Add {
        /// Account id
        account: String,
        /// Amount in major units, e.g. -12.50
        #[arg(allow_hyphen_values = true)]
        amount: String,
        /// Description
        #[arg(required = true)]
        description: Vec<String>,
        #[arg(long, value_name = "ID")]
        category: Option<String>,
    },
    /// List transactions
    List {
        #[arg(long, value_name = "ID")]
        account: Option<String>,
        #[arg(long, value_name = "ID")]
        category: Option<String>,
        /// Number of transactions to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Change (or with no --category, clear) the category
    Categorize {
        id: String,
        #[arg(long, value_name = "ID")]
        category: Option<String>,
    },
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
pub enum InboxCommands {
    /// Capture an expense to sort out later
    Add {
        #[arg(required = true)]
        description: Vec<String>,
        /// Amount in major units
        #[arg(long, allow_hyphen_values = true)]
        amount: Option<String>,
    },
    /// List unprocessed items
    List,
    /// Turn an item into a transaction
    Process {
        id: String,
        #[arg(long, value_name = "ID")]
        account: String,
        #[arg(long, value_name = "ID")]
        category: Option<String>,
    },
    Dismiss {
        id: String,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum AccountKindArg {
    Checking,
    Savings,
    Credit,
    Cash,
    Investment,
}

impl From<AccountKindArg> for AccountKind {
    fn from(kind: AccountKindArg) -> Self {
        match kind {
            AccountKindArg::Checking => Self::Checking,
            AccountKindArg::Savings => Self::Savings,
            AccountKindArg::Credit => Self::Credit,
            AccountKindArg::Cash => Self::Cash,
            AccountKindArg::Investment => Self::Investment,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CategoryKindArg {
    Income,
    Expense,
}

impl From<CategoryKindArg> for CategoryKind {
    fn from(kind: CategoryKindArg) -> Self {
        match kind {
            CategoryKindArg::Income => Self::Income,
            CategoryKindArg::Expense => Self::Expense,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KeepSide {
    Local,
    Remote,
}

impl From<KeepSide> for Resolution {
    fn from(side: KeepSide) -> Self {
        match side {
            KeepSide::Local => Self::KeepLocal,
            KeepSide::Remote => Self::KeepRemote,
        }
    }
}
