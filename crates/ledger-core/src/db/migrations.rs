//! Database migrations
//!
//! `MIGRATIONS` is append-only: clients on older binaries replay the same
//! history, so existing steps are never edited or removed. Schema changes are
//! additive.

use crate::error::{Error, Result};
use libsql::Connection;

/// A single schema change, keyed by the version it migrates to
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    pub statements: &'static [&'static str],
}

/// Ordered migration history
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "syncable ledger tables",
        statements: &[
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            "CREATE TABLE IF NOT EXISTS categories (
                id TEXT PRIMARY KEY,
                version INTEGER NOT NULL DEFAULT 0,
                deleted_at INTEGER,
                local_sync_status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                name TEXT NOT NULL,
                parent_id TEXT,
                kind TEXT NOT NULL,
                color TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_categories_version ON categories(version)",
            "CREATE INDEX IF NOT EXISTS idx_categories_updated ON categories(updated_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_categories_deleted ON categories(deleted_at)",
            "CREATE INDEX IF NOT EXISTS idx_categories_status ON categories(local_sync_status)",
            "CREATE INDEX IF NOT EXISTS idx_categories_parent ON categories(parent_id)",
            "CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                version INTEGER NOT NULL DEFAULT 0,
                deleted_at INTEGER,
                local_sync_status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                currency_code TEXT NOT NULL,
                balance_cents INTEGER NOT NULL DEFAULT 0,
                is_archived INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE INDEX IF NOT EXISTS idx_accounts_version ON accounts(version)",
            "CREATE INDEX IF NOT EXISTS idx_accounts_updated ON accounts(updated_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_accounts_deleted ON accounts(deleted_at)",
            "CREATE INDEX IF NOT EXISTS idx_accounts_status ON accounts(local_sync_status)",
            "CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                version INTEGER NOT NULL DEFAULT 0,
                deleted_at INTEGER,
                local_sync_status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                account_id TEXT NOT NULL,
                category_id TEXT,
                amount_cents INTEGER NOT NULL,
                currency_code TEXT NOT NULL,
                description TEXT NOT NULL,
                occurred_at INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_transactions_version ON transactions(version)",
            "CREATE INDEX IF NOT EXISTS idx_transactions_updated ON transactions(updated_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_transactions_deleted ON transactions(deleted_at)",
            "CREATE INDEX IF NOT EXISTS idx_transactions_status ON transactions(local_sync_status)",
            "CREATE INDEX IF NOT EXISTS idx_transactions_account ON transactions(account_id)",
            "CREATE INDEX IF NOT EXISTS idx_transactions_category ON transactions(category_id)",
            "CREATE TABLE IF NOT EXISTS inbox_items (
                id TEXT PRIMARY KEY,
                version INTEGER NOT NULL DEFAULT 0,
                deleted_at INTEGER,
                local_sync_status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                description TEXT NOT NULL,
                amount_cents INTEGER,
                account_id TEXT,
                category_id TEXT,
                status TEXT NOT NULL DEFAULT 'unprocessed'
            )",
            "CREATE INDEX IF NOT EXISTS idx_inbox_items_version ON inbox_items(version)",
            "CREATE INDEX IF NOT EXISTS idx_inbox_items_updated ON inbox_items(updated_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_inbox_items_deleted ON inbox_items(deleted_at)",
            "CREATE INDEX IF NOT EXISTS idx_inbox_items_status ON inbox_items(local_sync_status)",
        ],
    },
    Migration {
        version: 2,
        description: "per-table watermarks and currency reference data",
        statements: &[
            "CREATE TABLE IF NOT EXISTS sync_metadata (
                table_name TEXT PRIMARY KEY,
                last_synced_version INTEGER NOT NULL DEFAULT 0,
                last_synced_at INTEGER
            )",
            "CREATE TABLE IF NOT EXISTS currencies (
                code TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                symbol TEXT NOT NULL,
                decimals INTEGER NOT NULL DEFAULT 2
            )",
        ],
    },
    Migration {
        version: 3,
        description: "conflict reasons and push outbox",
        statements: &[
            "ALTER TABLE categories ADD COLUMN sync_error TEXT",
            "ALTER TABLE accounts ADD COLUMN sync_error TEXT",
            "ALTER TABLE transactions ADD COLUMN sync_error TEXT",
            "ALTER TABLE inbox_items ADD COLUMN sync_error TEXT",
            "CREATE TABLE IF NOT EXISTS sync_outbox (
                table_name TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                revision INTEGER NOT NULL DEFAULT 1,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                base_snapshot TEXT,
                enqueued_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (table_name, entity_id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_outbox_enqueued ON sync_outbox(table_name, enqueued_at)",
        ],
    },
];

/// Schema version this binary migrates to
pub fn latest() -> i32 {
    MIGRATIONS.last().map_or(0, |migration| migration.version)
}

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    run_steps(conn, MIGRATIONS).await
}

async fn run_steps(conn: &Connection, steps: &[Migration]) -> Result<()> {
    validate(steps)?;
    let version = current_version(conn).await?;

    for migration in steps.iter().filter(|m| m.version > version) {
        apply(conn, migration).await?;
    }

    Ok(())
}

/// Versions must be strictly increasing so replay order is unambiguous
fn validate(steps: &[Migration]) -> Result<()> {
    let mut previous = 0;
    for migration in steps {
        if migration.version <= previous {
            return Err(Error::Database(format!(
                "migration {} ({}) is out of order after version {previous}",
                migration.version, migration.description
            )));
        }
        previous = migration.version;
    }
    Ok(())
}

/// Get the current schema version
pub async fn current_version(conn: &Connection) -> Result<i32> {
    // Check if schema_version table exists
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

async fn apply(conn: &Connection, migration: &Migration) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in migration.statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn
        .execute(
            "INSERT INTO schema_version (version) VALUES (?)",
            [i64::from(migration.version)],
        )
        .await
    {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!(
        "Migrated database to version {} ({})",
        migration.version,
        migration.description
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::Builder;

    async fn setup() -> Connection {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, name: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT EXISTS(
                    SELECT 1 FROM sqlite_master
                    WHERE type = 'table' AND name = ?
                )",
                [name],
            )
            .await
            .unwrap();

        rows.next()
            .await
            .unwrap()
            .is_some_and(|row| row.get::<i32>(0).unwrap() != 0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let version = current_version(&conn).await.unwrap();
        assert_eq!(version, latest());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_idempotent() {
        let conn = setup().await;
        run(&conn).await.unwrap();
        run(&conn).await.unwrap(); // Should not fail

        let version = current_version(&conn).await.unwrap();
        assert_eq!(version, latest());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_create_sync_tables() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        for table in ["accounts", "categories", "transactions", "inbox_items"] {
            assert!(table_exists(&conn, table).await, "{table} missing");
        }
        assert!(table_exists(&conn, "sync_metadata").await);
        assert!(table_exists(&conn, "sync_outbox").await);
        assert!(table_exists(&conn, "currencies").await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_replays_only_pending_steps() {
        let conn = setup().await;
        run_steps(&conn, &MIGRATIONS[..1]).await.unwrap();
        assert_eq!(current_version(&conn).await.unwrap(), 1);
        assert!(!table_exists(&conn, "sync_outbox").await);

        run(&conn).await.unwrap();
        assert_eq!(current_version(&conn).await.unwrap(), latest());
        assert!(table_exists(&conn, "sync_outbox").await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_step_rolls_back() {
        const BROKEN: &[Migration] = &[Migration {
            version: 1,
            description: "broken",
            statements: &[
                "CREATE TABLE schema_version (version INTEGER PRIMARY KEY)",
                "CREATE TABLE half_done (id TEXT)",
                "THIS IS NOT SQL",
            ],
        }];

        let conn = setup().await;
        assert!(run_steps(&conn, BROKEN).await.is_err());
        assert!(!table_exists(&conn, "half_done").await);
        assert_eq!(current_version(&conn).await.unwrap(), 0);
    }

    #[test]
    fn test_validate_rejects_out_of_order_steps() {
        const SWAPPED: &[Migration] = &[
            Migration {
                version: 2,
                description: "second",
                statements: &[],
            },
            Migration {
                version: 1,
                description: "first",
                statements: &[],
            },
        ];

        assert!(validate(MIGRATIONS).is_ok());
        assert!(validate(SWAPPED).is_err());
    }
}
