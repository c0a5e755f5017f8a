//! Account model

use libsql::Value;
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::sync_meta::enum_text;
use super::{RowReader, SyncEntity, SyncMeta, Table};

/// Kind of money container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    #[default]
    Checking,
    Savings,
    Credit,
    Cash,
    Investment,
}

/// A bank account, card, wallet or brokerage account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    #[serde(flatten)]
    pub meta: SyncMeta,
    /// Display name
    pub name: String,
    pub kind: AccountKind,
    /// ISO 4217 code, references `currencies.code`
    pub currency_code: String,
    /// Current balance in minor units
    pub balance_cents: i64,
    #[serde(default)]
    pub is_archived: bool,
}

impl Account {
    /// Create an unsaved account; the repository assigns its id
    #[must_use]
    pub fn new(name: impl Into<String>, kind: AccountKind, currency_code: impl Into<String>) -> Self {
        Self {
            meta: SyncMeta::draft(),
            name: name.into(),
            kind,
            currency_code: currency_code.into(),
            balance_cents: 0,
            is_archived: false,
        }
    }
}

impl SyncEntity for Account {
    const TABLE: Table = Table::Accounts;
    const COLUMNS: &'static [&'static str] =
        &["name", "kind", "currency_code", "balance_cents", "is_archived"];

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn to_values(&self) -> Result<Vec<Value>> {
        Ok(vec![
            Value::Text(self.name.clone()),
            enum_text(&self.kind)?,
            Value::Text(self.currency_code.clone()),
            Value::Integer(self.balance_cents),
            Value::Integer(i64::from(self.is_archived)),
        ])
    }

    fn from_row(reader: &mut RowReader<'_>, meta: SyncMeta) -> Result<Self> {
        Ok(Self {
            meta,
            name: reader.text()?,
            kind: reader.enumeration()?,
            currency_code: reader.text()?,
            balance_cents: reader.int()?,
            is_archived: reader.bool()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_new_is_draft() {
        let account = Account::new("Checking", AccountKind::Checking, "USD");
        assert!(account.id().is_none());
        assert_eq!(account.balance_cents, 0);
        assert!(!account.is_archived);
    }

    #[test]
    fn test_account_values_match_columns() {
        let account = Account::new("Card", AccountKind::Credit, "EUR");
        let values = account.to_values().unwrap();
        assert_eq!(values.len(), Account::COLUMNS.len());
        assert_eq!(values[1], Value::Text("credit".into()));
    }

    #[test]
    fn test_account_wire_shape_is_flat() {
        let mut account = Account::new("Wallet", AccountKind::Cash, "USD");
        account.meta.version = 7;
        let json = serde_json::to_value(&account).unwrap();
        assert_eq!(json["version"], 7);
        assert_eq!(json["kind"], "cash");
        assert!(json.get("meta").is_none());
    }
}
