//! Error types for the mail gateway.

use std::path::PathBuf;

/// Configuration-related errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ledger storage errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Per-account mailbox failures. Recovered by the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Failed to connect to {server}: {reason}")]
    Connect { server: String, reason: String },

    #[error("TLS setup failed for {server}: {reason}")]
    Tls { server: String, reason: String },

    #[error("Authentication failed for {account}")]
    AuthFailed { account: String },

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mailbox worker failed: {0}")]
    Worker(#[from] WorkerError),
}

/// Model backend errors for a single call.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Request to model {model} failed: {reason}")]
    RequestFailed { model: String, reason: String },

    #[error("Model {model} rate limited")]
    RateLimited { model: String },

    #[error("Model {model} not available")]
    ModelNotAvailable { model: String },

    #[error("Authentication failed for model backend")]
    AuthFailed,

    #[error("Invalid response from model {model}: {reason}")]
    InvalidResponse { model: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Why a classification degraded. Carried next to the substituted result,
/// never raised.
#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    #[error("No model API key configured")]
    NotConfigured,

    #[error("All {} candidate model(s) failed; last: {}", .attempts.len(), last_attempt(.attempts))]
    Exhausted { attempts: Vec<(String, String)> },
}

fn last_attempt(attempts: &[(String, String)]) -> String {
    attempts
        .last()
        .map(|(model, reason)| format!("{model}: {reason}"))
        .unwrap_or_else(|| "no candidates".to_string())
}

/// Webhook delivery failures. Logged and dropped.
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("No webhook configured")]
    NotConfigured,

    #[error("Webhook request failed: {0}")]
    Transport(String),

    #[error("Webhook returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Webhook rejected the card (code {code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("Notification worker failed: {0}")]
    Worker(#[from] WorkerError),
}

/// Worker pool failures.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker pool is closed")]
    Closed,

    #[error("Worker job panicked: {0}")]
    Panicked(String),
}
