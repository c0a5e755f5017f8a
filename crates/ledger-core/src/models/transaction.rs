//! Transaction model

use libsql::Value;
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::sync_meta::opt_id;
use super::{EntityId, RowReader, SyncEntity, SyncMeta, Table};

/// A posted movement of money on an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(flatten)]
    pub meta: SyncMeta,
    pub account_id: EntityId,
    #[serde(default)]
    pub category_id: Option<EntityId>,
    /// Signed amount in minor units (negative = outflow)
    pub amount_cents: i64,
    pub currency_code: String,
    pub description: String,
    /// When the transaction happened (Unix ms)
    pub occurred_at: i64,
}

impl Transaction {
    /// Create an unsaved transaction
    #[must_use]
    pub fn new(
        account_id: EntityId,
        amount_cents: i64,
        currency_code: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            meta: SyncMeta::draft(),
            account_id,
            category_id: None,
            amount_cents,
            currency_code: currency_code.into(),
            description: description.into(),
            occurred_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    #[must_use]
    pub const fn with_category(mut self, category_id: EntityId) -> Self {
        self.category_id = Some(category_id);
        self
    }

    pub const fn is_outflow(&self) -> bool {
        self.amount_cents < 0
    }
}

impl SyncEntity for Transaction {
    const TABLE: Table = Table::Transactions;
    const COLUMNS: &'static [&'static str] = &[
        "account_id",
        "category_id",
        "amount_cents",
        "currency_code",
        "description",
        "occurred_at",
    ];

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn to_values(&self) -> Result<Vec<Value>> {
        Ok(vec![
            Value::Text(self.account_id.as_str()),
            opt_id(self.category_id),
            Value::Integer(self.amount_cents),
            Value::Text(self.currency_code.clone()),
            Value::Text(self.description.clone()),
            Value::Integer(self.occurred_at),
        ])
    }

    fn from_row(reader: &mut RowReader<'_>, meta: SyncMeta) -> Result<Self> {
        Ok(Self {
            meta,
            account_id: reader.id()?,
            category_id: reader.opt_id()?,
            amount_cents: reader.int()?,
            currency_code: reader.text()?,
            description: reader.text()?,
            occurred_at: reader.int()?,
        })
    }
}
