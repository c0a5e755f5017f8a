//! Category model

use libsql::Value;
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::sync_meta::{enum_text, opt_id, opt_text};
use super::{EntityId, RowReader, SyncEntity, SyncMeta, Table};

/// Whether a category groups money in or money out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CategoryKind {
    Income,
    #[default]
    Expense,
}

/// A spending or income category, optionally nested under a parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    #[serde(flatten)]
    pub meta: SyncMeta,
    pub name: String,
    /// Parent category, `None` for top-level categories
    #[serde(default)]
    pub parent_id: Option<EntityId>,
    pub kind: CategoryKind,
    /// Display color (`#rrggbb`)
    #[serde(default)]
    pub color: Option<String>,
}

impl Category {
    /// Create an unsaved top-level category
    #[must_use]
    pub fn new(name: impl Into<String>, kind: CategoryKind) -> Self {
        Self {
            meta: SyncMeta::draft(),
            name: name.into(),
            parent_id: None,
            kind,
            color: None,
        }
    }

    /// Nest this category under `parent`
    #[must_use]
    pub const fn with_parent(mut self, parent: EntityId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    /// Top-level categories are the ones other categories can nest under
    pub const fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

impl SyncEntity for Category {
    const TABLE: Table = Table::Categories;
    const COLUMNS: &'static [&'static str] = &["name", "parent_id", "kind", "color"];

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn to_values(&self) -> Result<Vec<Value>> {
        Ok(vec![
            Value::Text(self.name.clone()),
            opt_id(self.parent_id),
            enum_text(&self.kind)?,
            opt_text(self.color.as_deref()),
        ])
    }

    fn from_row(reader: &mut RowReader<'_>, meta: SyncMeta) -> Result<Self> {
        Ok(Self {
            meta,
            name: reader.text()?,
            parent_id: reader.opt_id()?,
            kind: reader.enumeration()?,
            color: reader.opt_text()?,
        })
    }
}
