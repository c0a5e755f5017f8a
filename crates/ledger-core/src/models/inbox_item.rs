//! Inbox item model

use libsql::Value;
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::sync_meta::{enum_text, opt_id, opt_int};
use super::{EntityId, RowReader, SyncEntity, SyncMeta, Table};

/// Triage state of a captured item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InboxStatus {
    #[default]
    Unprocessed,
    Processed,
    Dismissed,
}

/// A quickly captured expense waiting to become a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxItem {
    #[serde(flatten)]
    pub meta: SyncMeta,
    pub description: String,
    #[serde(default)]
    pub amount_cents: Option<i64>,
    #[serde(default)]
    pub account_id: Option<EntityId>,
    #[serde(default)]
    pub category_id: Option<EntityId>,
    #[serde(default)]
    pub status: InboxStatus,
}

impl InboxItem {
    /// Capture a new unprocessed item
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            meta: SyncMeta::draft(),
            description: description.into(),
            amount_cents: None,
            account_id: None,
            category_id: None,
            status: InboxStatus::Unprocessed,
        }
    }

    #[must_use]
    pub const fn with_amount(mut self, amount_cents: i64) -> Self {
        self.amount_cents = Some(amount_cents);
        self
    }
}

impl SyncEntity for InboxItem {
    const TABLE: Table = Table::InboxItems;
    const COLUMNS: &'static [&'static str] = &[
        "description",
        "amount_cents",
        "account_id",
        "category_id",
        "status",
    ];

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn to_values(&self) -> Result<Vec<Value>> {
        Ok(vec![
            Value::Text(self.description.clone()),
            opt_int(self.amount_cents),
            opt_id(self.account_id),
            opt_id(self.category_id),
            enum_text(&self.status)?,
        ])
    }

    fn from_row(reader: &mut RowReader<'_>, meta: SyncMeta) -> Result<Self> {
        Ok(Self {
            meta,
            description: reader.text()?,
            amount_cents: reader.opt_int()?,
            account_id: reader.opt_id()?,
            category_id: reader.opt_id()?,
            status: reader.enumeration()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbox_item_defaults() {
        let item = InboxItem::new("Lunch receipt").with_amount(-1800);
        assert_eq!(item.status, InboxStatus::Unprocessed);
        assert_eq!(item.amount_cents, Some(-1800));
        assert_eq!(item.to_values().unwrap().len(), InboxItem::COLUMNS.len());
    }

    #[test]
    fn test_status_defaults_when_missing_on_wire() {
        let json = serde_json::json!({
            "id": "0190c6a4-9d52-7cc0-8d0b-0c4a52f0b6f1",
            "version": 3,
            "description": "Taxi",
        });
        let item: InboxItem = serde_json::from_value(json).unwrap();
        assert_eq!(item.status, InboxStatus::Unprocessed);
        assert_eq!(item.meta.version, 3);
    }
}
