//! Table registry shared by the local schema, the outbox and the wire protocol

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Every table the sync engine knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Categories,
    Accounts,
    Transactions,
    InboxItems,
    Currencies,
}

impl Table {
    /// Syncable tables, parents before the children that reference them.
    ///
    /// Pushes walk this order so a transaction never reaches the server
    /// before the account or category it points at.
    pub const PUSH_ORDER: [Self; 4] = [
        Self::Categories,
        Self::Accounts,
        Self::Transactions,
        Self::InboxItems,
    ];

    /// All tables in pull order (reference data first)
    pub const ALL: [Self; 5] = [
        Self::Currencies,
        Self::Categories,
        Self::Accounts,
        Self::Transactions,
        Self::InboxItems,
    ];

    /// Storage and wire name
    pub const fn name(self) -> &'static str {
        match self {
            Self::Categories => "categories",
            Self::Accounts => "accounts",
            Self::Transactions => "transactions",
            Self::InboxItems => "inbox_items",
            Self::Currencies => "currencies",
        }
    }

    /// Tables whose queued pushes must land before this one's
    pub fn push_dependencies(self) -> Vec<Self> {
        Self::PUSH_ORDER
            .into_iter()
            .take_while(|table| *table != self)
            .collect()
    }

    /// Whether rows carry sync metadata and can be pushed
    pub const fn is_syncable(self) -> bool {
        !matches!(self, Self::Currencies)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Table {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|table| table.name() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown table: {s}")))
    }
}
