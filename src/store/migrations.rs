//! Version-tracked ledger migrations.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones. A ledger written by
//! the earlier deployment (a `processed_emails` table and no `_migrations`
//! table) is adopted: V1 is seeded without re-creating the table and the
//! `alias` column is added if it is missing.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "processed_emails",
        sql: r#"
            CREATE TABLE IF NOT EXISTS processed_emails (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_email TEXT NOT NULL,
                alias TEXT,
                uid TEXT NOT NULL,
                category TEXT,
                summary TEXT,
                processed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(account_email, uid)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "processed_at_index",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_processed_emails_processed_at
                ON processed_emails(processed_at);
        "#,
    },
];

/// Run all pending migrations against `conn`.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    if current_version == 0 && legacy_table_exists(conn).await? {
        // Older ledgers were created before the alias column existed.
        if !column_exists(conn, "processed_emails", "alias").await? {
            conn.execute("ALTER TABLE processed_emails ADD COLUMN alias TEXT", ())
                .await
                .map_err(|e| {
                    DatabaseError::Migration(format!("Failed to add alias column: {e}"))
                })?;
        }
        seed_version(conn, 1, "processed_emails").await?;
        tracing::info!("Legacy ledger detected, seeded migration V1");
    }

    let current_version = get_current_version(conn).await?;
    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::debug!(
        version = get_current_version(conn).await?,
        "Ledger migrations complete"
    );
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Check if a `processed_emails` table already exists.
async fn legacy_table_exists(conn: &Connection) -> Result<bool, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='processed_emails'",
            (),
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to check legacy table: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to read legacy check: {e}")))?;

    Ok(row.map(|r| r.get::<i64>(0).unwrap_or(0) > 0).unwrap_or(false))
}

/// Check whether `table` has a column called `column`.
async fn column_exists(
    conn: &Connection,
    table: &str,
    column: &str,
) -> Result<bool, DatabaseError> {
    let mut rows = conn
        .query(&format!("PRAGMA table_info({table})"), ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to inspect {table}: {e}")))?;

    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read {table} columns: {e}")))?
    {
        let name: String = row
            .get(1)
            .map_err(|e| DatabaseError::Migration(format!("Failed to parse column info: {e}")))?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
