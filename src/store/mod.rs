//! Dedup ledger: durable record of processed `(account, uid)` pairs.

pub mod libsql_backend;
pub(crate) mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlLedger;
pub use traits::{Ledger, ProcessedRecord};
