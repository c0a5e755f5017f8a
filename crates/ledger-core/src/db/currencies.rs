//! Currency reference data (pull-only)

use libsql::params::Params;
use libsql::Connection;

use crate::error::Result;
use crate::models::{Currency, RowReader};

pub struct CurrencyRepository<'a> {
    conn: &'a Connection,
}

impl<'a> CurrencyRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Replace the cached list with the remote one. Runs in the caller's
    /// transaction when there is one.
    pub async fn replace_all(&self, currencies: &[Currency]) -> Result<()> {
        self.conn.execute("DELETE FROM currencies", ()).await?;
        for currency in currencies {
            self.conn
                .execute(
                    "INSERT INTO currencies (code, name, symbol, decimals) VALUES (?, ?, ?, ?)",
                    Params::Positional(currency.to_values()),
                )
                .await?;
        }
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Currency>> {
        let mut rows = self
            .conn
            .query(
                "SELECT code, name, symbol, decimals FROM currencies ORDER BY code",
                (),
            )
            .await?;

        let mut currencies = Vec::new();
        while let Some(row) = rows.next().await? {
            currencies.push(Currency::from_row(&mut RowReader::new(&row))?);
        }
        Ok(currencies)
    }

    pub async fn get(&self, code: &str) -> Result<Option<Currency>> {
        let mut rows = self
            .conn
            .query(
                "SELECT code, name, symbol, decimals FROM currencies WHERE code = ?",
                [code],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Currency::from_row(&mut RowReader::new(&row))?)),
            None => Ok(None),
        }
    }
}
