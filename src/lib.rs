//! Mail gateway: polls IMAP mailboxes, classifies new mail with a language
//! model and pushes a chat card per message to a Feishu webhook.

pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod store;
pub mod worker;
