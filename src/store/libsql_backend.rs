//! libSQL backend: async `Ledger` implementation.
//!
//! The database handle is shared, but every operation opens its own
//! short-lived connection, so concurrent account tasks never contend on a
//! single long-lived handle. The `UNIQUE(account_email, uid)` constraint is
//! the only synchronization the ledger relies on.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::pipeline::types::ClassificationResult;
use crate::store::migrations;
use crate::store::traits::{Ledger, ProcessedRecord};

/// How long a connection waits on a locked database file before failing.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Timestamp format matching SQLite's `CURRENT_TIMESTAMP`, so rows written
/// by older deployments sort correctly next to ours.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

const RECORD_COLUMNS: &str = "account_email, alias, uid, category, summary, processed_at";

/// libSQL ledger backed by a local database file.
pub struct LibSqlLedger {
    db: Arc<LibSqlDatabase>,
}

impl LibSqlLedger {
    /// Open (or create) a local ledger file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let ledger = Self {
            db: Arc::new(db),
        };
        let conn = ledger.connect().await?;
        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Ledger opened");
        Ok(ledger)
    }

    /// Open a fresh connection for one operation.
    async fn connect(&self) -> Result<Connection, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        conn.query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to set busy timeout: {e}")))?;
        Ok(conn)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Map a libsql Row to a ProcessedRecord (column order = RECORD_COLUMNS).
fn row_to_record(row: &libsql::Row) -> Result<ProcessedRecord, libsql::Error> {
    let processed_at: String = row.get(5)?;
    Ok(ProcessedRecord {
        account_email: row.get(0)?,
        alias: row.get::<String>(1).ok(),
        uid: row.get(2)?,
        category: row.get::<String>(3).ok(),
        summary: row.get::<String>(4).ok(),
        processed_at: parse_datetime(&processed_at),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Ledger for LibSqlLedger {
    async fn is_processed(&self, account_email: &str, uid: &str) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT 1 FROM processed_emails WHERE account_email = ?1 AND uid = ?2",
                params![account_email, uid],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("is_processed: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("is_processed: {e}")))?;
        Ok(row.is_some())
    }

    async fn record(
        &self,
        account_email: &str,
        alias: &str,
        uid: &str,
        result: &ClassificationResult,
    ) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let now = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO processed_emails
                    (account_email, alias, uid, category, summary, processed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    account_email,
                    alias,
                    uid,
                    result.category.as_str(),
                    result.summary.as_str(),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record: {e}")))?;

        if inserted == 0 {
            debug!(account = account_email, uid, "Ledger already had this message");
        }
        Ok(inserted > 0)
    }

    async fn recent_history(&self, limit: usize) -> Result<Vec<ProcessedRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM processed_emails
                     ORDER BY processed_at DESC, id DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_history: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_history: {e}")))?
        {
            match row_to_record(&row) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping ledger row: {e}"),
            }
        }
        Ok(records)
    }
}
