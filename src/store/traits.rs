//! `Ledger` trait: the single source of truth for "has this message been handled".

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::pipeline::types::ClassificationResult;

/// A persisted ledger row.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedRecord {
    pub account_email: String,
    pub alias: Option<String>,
    pub uid: String,
    pub category: Option<String>,
    pub summary: Option<String>,
    pub processed_at: DateTime<Utc>,
}

/// Backend-agnostic ledger.
///
/// Lookup and insert are independent: two concurrent passes over the same
/// account may both see a uid as unprocessed. The storage-level uniqueness
/// constraint makes the second `record` a no-op, so the ledger never holds
/// two rows for one `(account_email, uid)` pair.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Whether `(account_email, uid)` has already been recorded.
    async fn is_processed(&self, account_email: &str, uid: &str) -> Result<bool, DatabaseError>;

    /// Insert-if-absent. Returns `true` when a new row was written and
    /// `false` when the pair was already present.
    async fn record(
        &self,
        account_email: &str,
        alias: &str,
        uid: &str,
        result: &ClassificationResult,
    ) -> Result<bool, DatabaseError>;

    /// Up to `limit` records, most recent first.
    async fn recent_history(&self, limit: usize) -> Result<Vec<ProcessedRecord>, DatabaseError>;
}
