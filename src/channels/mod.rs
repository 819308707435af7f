//! Mailbox access.

pub mod imap;

pub use imap::{ImapFetcher, MailboxFetcher};
