//! Currency reference model

use libsql::Value;
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::RowReader;

/// Read-only reference data pulled from the remote; never pushed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Currency {
    /// ISO 4217 code
    pub code: String,
    pub name: String,
    pub symbol: String,
    /// Number of minor-unit digits
    pub decimals: u8,
}

impl Currency {
    pub const COLUMNS: [&'static str; 4] = ["code", "name", "symbol", "decimals"];

    pub fn from_row(reader: &mut RowReader<'_>) -> Result<Self> {
        Ok(Self {
            code: reader.text()?,
            name: reader.text()?,
            symbol: reader.text()?,
            decimals: u8::try_from(reader.int()?).unwrap_or(2),
        })
    }

    pub fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.code.clone()),
            Value::Text(self.name.clone()),
            Value::Text(self.symbol.clone()),
            Value::Integer(i64::from(self.decimals)),
        ]
    }

    /// Format an amount in minor units, e.g. `-1250` → `-$12.50`
    #[must_use]
    pub fn format_minor(&self, amount: i64) -> String {
        let sign = if amount < 0 { "-" } else { "" };
        let magnitude = amount.unsigned_abs();
        if self.decimals == 0 {
            return format!("{sign}{}{magnitude}", self.symbol);
        }
        let scale = 10u64.pow(u32::from(self.decimals));
        format!(
            "{sign}{}{}.{:0width$}",
            self.symbol,
            magnitude / scale,
            magnitude % scale,
            width = usize::from(self.decimals)
        )
    }
}
