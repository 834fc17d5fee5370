//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
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

async fn apply(conn: &Connection, statements: &[&str]) -> Result<()> {
    // libsql doesn't have execute_batch, so we run each statement separately
    // inside a transaction for atomicity
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    Ok(())
}

/// Migration to version 1: transactions, owners, and sync bookkeeping
async fn migrate_v1(conn: &Connection) -> Result<()> {
    let statements = [
        // Schema version tracking
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        // Transaction records, keyed by the immutable local id
        "CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            server_id TEXT,
            owner_id TEXT NOT NULL,
            date TEXT NOT NULL,
            category TEXT NOT NULL,
            description TEXT NOT NULL,
            amount_minor INTEGER NOT NULL,
            kind TEXT NOT NULL,
            merchant TEXT,
            sync_status TEXT NOT NULL,
            local_created_at INTEGER NOT NULL,
            local_updated_at INTEGER NOT NULL,
            remote_updated_at INTEGER,
            is_archived INTEGER NOT NULL DEFAULT 0
        )",
        "CREATE INDEX IF NOT EXISTS idx_transactions_owner_date
            ON transactions(owner_id, date)",
        "CREATE INDEX IF NOT EXISTS idx_transactions_owner_archived
            ON transactions(owner_id, is_archived)",
        "CREATE INDEX IF NOT EXISTS idx_transactions_owner_status
            ON transactions(owner_id, sync_status)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_transactions_server_id
            ON transactions(server_id) WHERE server_id IS NOT NULL",
        // Owner identities (guest and authenticated)
        "CREATE TABLE IF NOT EXISTS owners (
            id TEXT PRIMARY KEY,
            mode TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
        // Per-owner sync bookkeeping
        "CREATE TABLE IF NOT EXISTS sync_state (
            owner_id TEXT PRIMARY KEY,
            last_synced_at INTEGER NOT NULL DEFAULT 0,
            pending_changes INTEGER NOT NULL DEFAULT 0
        )",
        // Record migration version
        "INSERT INTO schema_version (version) VALUES (1)",
    ];

    apply(conn, &statements).await?;
    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: persistent conflict log
async fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS sync_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            transaction_id TEXT NOT NULL,
            server_id TEXT NOT NULL,
            local_updated_at INTEGER NOT NULL,
            incoming_updated_at INTEGER NOT NULL,
            detected_at INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_transaction_id
            ON sync_conflicts(transaction_id)",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_detected_at
            ON sync_conflicts(detected_at DESC)",
        "INSERT INTO schema_version (version) VALUES (2)",
    ];

    apply(conn, &statements).await?;
    tracing::info!("Migrated database to version {CURRENT_VERSION}");
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

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_idempotent() {
        let conn = setup().await;
        run(&conn).await.unwrap();
        run(&conn).await.unwrap(); // Should not fail

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_server_id_index_is_unique() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let insert = "INSERT INTO transactions (
            id, server_id, owner_id, date, category, description, amount_minor,
            kind, sync_status, local_created_at, local_updated_at
        ) VALUES (?1, ?2, 'alice', '2024-01-01', 'misc', 'x', 100,
            'expense', 'synced', 0, 0)";

        conn.execute(insert, libsql::params!["t1", "srv-1"])
            .await
            .unwrap();
        // NULL server ids may repeat
        conn.execute(insert, libsql::params!["t2", libsql::Value::Null])
            .await
            .unwrap();
        conn.execute(insert, libsql::params!["t3", libsql::Value::Null])
            .await
            .unwrap();
        // A duplicated server id must be rejected
        let duplicate = conn.execute(insert, libsql::params!["t4", "srv-1"]).await;
        assert!(duplicate.is_err());
    }
}
