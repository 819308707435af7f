//! Mailbox fetcher: raw IMAP over rustls.
//!
//! Blocking: run through `WorkerPool::run_blocking`. Messages are read with
//! `BODY.PEEK[]`, so the server's unseen flag is left as it was and the
//! ledger alone decides what has been handled.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use regex::Regex;
use secrecy::ExposeSecret;

use crate::config::AccountConfig;
use crate::error::MailboxError;
use crate::pipeline::types::MailMessage;

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest literal accepted from the server.
const MAX_LITERAL_BYTES: usize = 50 * 1024 * 1024;

static LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\d+)\}\s*$").expect("valid literal regex"));

static FETCH_UID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bUID (\d+)").expect("valid uid regex"));

/// Per-account capability returning unread messages.
///
/// Implementations block; callers run them on the worker pool.
pub trait MailboxFetcher: Send + Sync {
    /// Unread messages, plus unread ones received inside the account's
    /// lookback window. No uid appears twice in one batch.
    fn fetch_unread(&self, account: &AccountConfig) -> Result<Vec<MailMessage>, MailboxError>;
}

/// IMAP fetcher over implicit TLS.
#[derive(Debug, Default, Clone)]
pub struct ImapFetcher;

impl ImapFetcher {
    pub fn new() -> Self {
        Self
    }
}

impl MailboxFetcher for ImapFetcher {
    fn fetch_unread(&self, account: &AccountConfig) -> Result<Vec<MailMessage>, MailboxError> {
        let (host, port) = account.imap_endpoint();
        let server = format!("{host}:{port}");

        let tcp = TcpStream::connect((host.as_str(), port)).map_err(|e| MailboxError::Connect {
            server: server.clone(),
            reason: e.to_string(),
        })?;
        tcp.set_read_timeout(Some(READ_TIMEOUT))?;
        tcp.set_write_timeout(Some(READ_TIMEOUT))?;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(host.clone()).map_err(|e| {
            MailboxError::Tls {
                server: server.clone(),
                reason: e.to_string(),
            }
        })?;
        let conn = rustls::ClientConnection::new(tls_config, server_name).map_err(|e| {
            MailboxError::Tls {
                server: server.clone(),
                reason: e.to_string(),
            }
        })?;

        tracing::debug!(account = %account.email, server = %server, "IMAP connected");
        let mut session = ImapSession::new(rustls::StreamOwned::new(conn, tcp));
        let since = lookback_date(account.lookback_days);
        collect_unread(&mut session, account, since)
    }
}

/// Run the login → select → search → fetch → logout conversation.
pub(crate) fn collect_unread<S: Read + Write>(
    session: &mut ImapSession<S>,
    account: &AccountConfig,
    since: Option<NaiveDate>,
) -> Result<Vec<MailMessage>, MailboxError> {
    let greeting = session.read_response_line()?;
    if !(greeting.text.starts_with("* OK") || greeting.text.starts_with("* PREAUTH")) {
        return Err(MailboxError::Protocol(format!(
            "unexpected greeting: {}",
            greeting.text
        )));
    }

    let login = session.command(&format!(
        "LOGIN {} {}",
        quote(&account.email),
        quote(account.password.expose_secret())
    ))?;
    if !login.is_ok() {
        return Err(MailboxError::AuthFailed {
            account: account.email.clone(),
        });
    }

    let select = session.command(&format!("SELECT {}", quote(&account.folder)))?;
    if !select.is_ok() {
        return Err(MailboxError::Protocol(format!(
            "cannot select {}: {}",
            account.folder, select.status
        )));
    }

    let mut uids = search(session, "UID SEARCH UNSEEN")?;
    if let Some(date) = since {
        let recent = search(session, &format!("UID SEARCH UNSEEN SINCE {}", imap_date(date)))?;
        merge_uids(&mut uids, recent);
    }

    let mut messages = Vec::with_capacity(uids.len());
    for uid in &uids {
        let reply = session.command(&format!("UID FETCH {uid} (UID BODY.PEEK[])"))?;
        if !reply.is_ok() {
            tracing::warn!(account = %account.email, uid = %uid, status = %reply.status, "IMAP fetch refused");
            continue;
        }
        let Some((uid, raw)) = fetched_body(&reply, uid) else {
            tracing::warn!(account = %account.email, uid = %uid, "IMAP fetch returned no body");
            continue;
        };
        match parse_message(&account.email, &uid, raw) {
            Some(message) => messages.push(message),
            None => tracing::warn!(account = %account.email, uid = %uid, "Unparsable message skipped"),
        }
    }

    if let Err(e) = session.command("LOGOUT") {
        tracing::debug!(account = %account.email, error = %e, "IMAP logout failed");
    }
    Ok(messages)
}

fn search<S: Read + Write>(
    session: &mut ImapSession<S>,
    command: &str,
) -> Result<Vec<String>, MailboxError> {
    let reply = session.command(command)?;
    if !reply.is_ok() {
        return Err(MailboxError::Protocol(format!(
            "{command} failed: {}",
            reply.status
        )));
    }
    Ok(parse_search(&reply.untagged))
}

// ── Session ─────────────────────────────────────────────────────────

/// One logical server line, with any `{N}` literals it carried.
#[derive(Debug, Default)]
pub(crate) struct ResponseLine {
    pub text: String,
    pub literals: Vec<Vec<u8>>,
}

/// Everything the server said in reply to one tagged command.
#[derive(Debug)]
pub(crate) struct Reply {
    pub untagged: Vec<ResponseLine>,
    /// Completion text after the tag, e.g. `OK LOGIN completed`.
    pub status: String,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.status
            .get(..2)
            .is_some_and(|s| s.eq_ignore_ascii_case("OK"))
    }
}

/// Tagged command/response exchange over any byte stream.
pub(crate) struct ImapSession<S: Read + Write> {
    stream: BufReader<S>,
    next_tag: u32,
}

impl<S: Read + Write> ImapSession<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            next_tag: 1,
        }
    }

    pub fn command(&mut self, command: &str) -> Result<Reply, MailboxError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let writer = self.stream.get_mut();
        writer.write_all(format!("{tag} {command}\r\n").as_bytes())?;
        writer.flush()?;

        let mut untagged = Vec::new();
        loop {
            let line = self.read_response_line()?;
            if let Some(status) = line
                .text
                .strip_prefix(tag.as_str())
                .and_then(|rest| rest.strip_prefix(' '))
            {
                return Ok(Reply {
                    untagged,
                    status: status.to_string(),
                });
            }
            untagged.push(line);
        }
    }

    /// Read one logical line, consuming literals and their continuations.
    pub fn read_response_line(&mut self) -> Result<ResponseLine, MailboxError> {
        let mut line = ResponseLine::default();
        loop {
            let mut raw = Vec::new();
            if self.stream.read_until(b'\n', &mut raw)? == 0 {
                return Err(MailboxError::Protocol("connection closed by server".into()));
            }
            let chunk = String::from_utf8_lossy(&raw);
            let chunk = chunk.trim_end_matches(['\r', '\n']);
            line.text.push_str(chunk);

            let Some(len) = literal_len(chunk) else {
                return Ok(line);
            };
            if len > MAX_LITERAL_BYTES {
                return Err(MailboxError::Protocol(format!(
                    "literal of {len} bytes exceeds limit"
                )));
            }
            let mut literal = vec![0u8; len];
            self.stream.read_exact(&mut literal)?;
            line.literals.push(literal);
        }
    }
}

// ── Helpers (public for testing) ────────────────────────────────────

/// Byte count announced by a trailing `{N}`.
pub(crate) fn literal_len(line: &str) -> Option<usize> {
    LITERAL
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// IMAP quoted string.
pub(crate) fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// `SINCE` date, e.g. `07-Mar-2026`.
pub(crate) fn imap_date(date: NaiveDate) -> String {
    date.format("%d-%b-%Y").to_string()
}

fn lookback_date(days: u32) -> Option<NaiveDate> {
    if days == 0 {
        return None;
    }
    Some((Utc::now() - chrono::Duration::days(i64::from(days))).date_naive())
}

/// Uids from `* SEARCH` lines, in server order, without duplicates.
pub(crate) fn parse_search(lines: &[ResponseLine]) -> Vec<String> {
    let mut uids = Vec::new();
    for line in lines {
        if let Some(rest) = line.text.strip_prefix("* SEARCH") {
            let found = rest
                .split_whitespace()
                .filter(|t| t.chars().all(|c| c.is_ascii_digit()))
                .map(str::to_string)
                .collect();
            merge_uids(&mut uids, found);
        }
    }
    uids
}

fn merge_uids(into: &mut Vec<String>, more: Vec<String>) {
    for uid in more {
        if !into.contains(&uid) {
            into.push(uid);
        }
    }
}

/// First `FETCH` line with a literal body. The uid reported by the server
/// wins over the one requested.
fn fetched_body<'a>(reply: &'a Reply, requested: &str) -> Option<(String, &'a [u8])> {
    reply
        .untagged
        .iter()
        .find(|l| l.text.contains("FETCH") && !l.literals.is_empty())
        .map(|l| {
            let uid = FETCH_UID
                .captures(&l.text)
                .and_then(|c| c.get(1))
                .map_or_else(|| requested.to_string(), |m| m.as_str().to_string());
            (uid, l.literals[0].as_slice())
        })
}

/// Parse an RFC 822 message into a `MailMessage`.
pub fn parse_message(account_email: &str, uid: &str, raw: &[u8]) -> Option<MailMessage> {
    let parsed = MessageParser::default().parse(raw)?;
    Some(MailMessage {
        account_email: account_email.to_string(),
        uid: uid.to_string(),
        subject: parsed.subject().unwrap_or("(no subject)").to_string(),
        sender: extract_sender(&parsed),
        body: extract_text(&parsed),
    })
}

fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into())
}

/// Plain text preferred, stripped HTML as fallback.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.to_string();
        }
    }
    "(no readable content)".to_string()
}

/// Drop tags, decode the common entities, collapse whitespace.
pub fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(ch),
            _ => {}
        }
    }
    let decoded = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Server transcript in, client commands out.
    struct Scripted {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Scripted {
        fn new(transcript: &str) -> Self {
            Self {
                input: Cursor::new(transcript.as_bytes().to_vec()),
                output: Vec::new(),
            }
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn account() -> AccountConfig {
        serde_json::from_value(serde_json::json!({
            "email": "ops@example.com",
            "alias": "Ops",
            "imap_server": "imap.example.com",
            "password": "pa\"ss",
        }))
        .unwrap()
    }

    fn literal(body: &str) -> String {
        format!("{{{}}}\r\n{}", body.len(), body)
    }

    const OTP_MAIL: &str = "From: Bank <no-reply@bank.example>\r\nSubject: Your code\r\n\r\nYour code is 119533.\r\n";
    const NEWS_MAIL: &str = "From: news@shop.example\r\nSubject: Sale\r\nContent-Type: text/html\r\n\r\n<p>Big <b>sale</b></p>\r\n";

    #[test]
    fn full_conversation_unions_searches_and_peeks() {
        let transcript = format!(
            "* OK ready\r\n\
             A1 OK LOGIN done\r\n\
             * 3 EXISTS\r\nA2 OK [READ-WRITE] SELECT done\r\n\
             * SEARCH 42 43\r\nA3 OK SEARCH done\r\n\
             * SEARCH 43 44\r\nA4 OK SEARCH done\r\n\
             * 1 FETCH (UID 42 BODY[] {otp})\r\nA5 OK FETCH done\r\n\
             * 2 FETCH (UID 43 BODY[] {news})\r\nA6 OK FETCH done\r\n\
             A7 NO no such message\r\n\
             * BYE\r\nA8 OK LOGOUT\r\n",
            otp = literal(OTP_MAIL),
            news = literal(NEWS_MAIL),
        );
        let mut session = ImapSession::new(Scripted::new(&transcript));
        let since = NaiveDate::from_ymd_opt(2026, 3, 7);

        let messages = collect_unread(&mut session, &account(), since).unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].uid, "42");
        assert_eq!(messages[0].account_email, "ops@example.com");
        assert_eq!(messages[0].subject, "Your code");
        assert_eq!(messages[0].sender, "no-reply@bank.example");
        assert!(messages[0].body.contains("119533"));
        assert_eq!(messages[1].uid, "43");
        assert!(messages[1].body.contains("Big sale"));

        let sent = String::from_utf8(session.stream.get_ref().output.clone()).unwrap();
        assert!(sent.contains("A1 LOGIN \"ops@example.com\" \"pa\\\"ss\"\r\n"));
        assert!(sent.contains("A2 SELECT \"INBOX\"\r\n"));
        assert!(sent.contains("A3 UID SEARCH UNSEEN\r\n"));
        assert!(sent.contains("A4 UID SEARCH UNSEEN SINCE 07-Mar-2026\r\n"));
        assert!(sent.contains("A5 UID FETCH 42 (UID BODY.PEEK[])\r\n"));
        assert!(sent.contains("A7 UID FETCH 44 (UID BODY.PEEK[])\r\n"));
        assert!(!sent.contains("STORE"));
    }

    #[test]
    fn rejected_login_is_auth_failure() {
        let mut session =
            ImapSession::new(Scripted::new("* OK ready\r\nA1 NO [AUTHENTICATIONFAILED] bad\r\n"));
        let err = collect_unread(&mut session, &account(), None).unwrap_err();
        assert!(matches!(err, MailboxError::AuthFailed { account } if account == "ops@example.com"));
    }

    #[test]
    fn missing_folder_is_protocol_error() {
        let mut session = ImapSession::new(Scripted::new(
            "* OK ready\r\nA1 OK\r\nA2 NO Mailbox doesn't exist\r\n",
        ));
        let err = collect_unread(&mut session, &account(), None).unwrap_err();
        assert!(err.to_string().contains("cannot select INBOX"));
    }

    #[test]
    fn closed_connection_is_protocol_error() {
        let mut session = ImapSession::new(Scripted::new("* OK ready\r\n"));
        let err = collect_unread(&mut session, &account(), None).unwrap_err();
        assert!(matches!(err, MailboxError::Protocol(_)));
    }

    #[test]
    fn no_unread_messages_yields_empty_batch() {
        let mut session = ImapSession::new(Scripted::new(
            "* OK ready\r\nA1 OK\r\nA2 OK\r\n* SEARCH\r\nA3 OK\r\nA4 OK\r\n",
        ));
        let messages = collect_unread(&mut session, &account(), None).unwrap();
        assert!(messages.is_empty());
    }

    #[test]
    fn literal_spanning_lines_is_read_whole() {
        let body = "line one\r\nline two\r\n";
        let transcript = format!("* 1 FETCH (UID 9 BODY[] {})\r\nA1 OK\r\n", literal(body));
        let mut session = ImapSession::new(Scripted::new(&transcript));
        let reply = session.command("UID FETCH 9 (UID BODY.PEEK[])").unwrap();

        assert!(reply.is_ok());
        assert_eq!(reply.untagged.len(), 1);
        assert_eq!(reply.untagged[0].literals[0], body.as_bytes());
        assert!(reply.untagged[0].text.ends_with(')'));
        let (uid, raw) = fetched_body(&reply, "1").unwrap();
        assert_eq!(uid, "9");
        assert_eq!(raw, body.as_bytes());
    }

    #[test]
    fn search_parsing_skips_noise_and_duplicates() {
        let lines = vec![
            ResponseLine {
                text: "* SEARCH 5 7 5".into(),
                literals: vec![],
            },
            ResponseLine {
                text: "* 4 EXISTS".into(),
                literals: vec![],
            },
            ResponseLine {
                text: "* SEARCH 8 (MODSEQ 12)".into(),
                literals: vec![],
            },
        ];
        assert_eq!(parse_search(&lines), vec!["5", "7", "8"]);
    }

    #[test]
    fn helpers() {
        assert_eq!(literal_len("* 1 FETCH (BODY[] {120}"), Some(120));
        assert_eq!(literal_len("* OK {no}"), None);
        assert_eq!(quote(r"a\b"), r#""a\\b""#);
        assert_eq!(
            imap_date(NaiveDate::from_ymd_opt(2026, 1, 2).unwrap()),
            "02-Jan-2026"
        );
        assert!(lookback_date(0).is_none());
        assert!(lookback_date(7).is_some());
    }

    #[test]
    fn strip_html_removes_tags_and_entities() {
        assert_eq!(strip_html("<p>Hello</p><p>World</p>"), "Hello World");
        assert_eq!(strip_html("<a href=\"x\">Fish &amp; chips</a>"), "Fish & chips");
        assert_eq!(strip_html("plain  text\n here"), "plain text here");
        assert_eq!(strip_html(""), "");
    }

    #[test]
    fn parse_message_defaults() {
        let msg = parse_message("a@b.c", "1", b"X-Test: 1\r\n\r\nhello\r\n").unwrap();
        assert_eq!(msg.subject, "(no subject)");
        assert_eq!(msg.sender, "unknown");
        assert!(msg.body.contains("hello"));
    }
}
