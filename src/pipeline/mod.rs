//! Polling pipeline.
//!
//! Every unread message flows through:
//! 1. `MailboxFetcher::fetch_unread()`: per-account IMAP fetch on the worker pool
//! 2. `Ledger::is_processed()`: drop uids already handled
//! 3. `Classifier::classify()`: model triage, degraded result on failure
//! 4. `Notifier::notify()`: best-effort Feishu card
//! 5. `Ledger::record()`: written even when the card was not delivered

pub mod classifier;
pub mod notifier;
pub mod rate_limit;
pub mod scheduler;
pub mod types;
