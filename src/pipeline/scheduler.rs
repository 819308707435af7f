//! Scheduler: repeated polling rounds over every enabled account.
//!
//! A round fans out one task per account. Each task fetches unread mail on
//! the worker pool, drops uids the ledger already knows, then handles the
//! rest one at a time: classify, notify, record. The record is written
//! whether or not the notification went out.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::channels::imap::MailboxFetcher;
use crate::config::{AccountConfig, DEFAULT_MESSAGE_INTERVAL_MILLIS, DEFAULT_POLL_INTERVAL_SECS};
use crate::error::MailboxError;
use crate::pipeline::classifier::Classifier;
use crate::pipeline::notifier::Notifier;
use crate::pipeline::rate_limit::{Clock, RateLimiter, SystemClock};
use crate::pipeline::types::{Classification, MailMessage};
use crate::store::Ledger;
use crate::worker::WorkerPool;

/// Outcome of one account's pass in a round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountReport {
    pub fetched: usize,
    pub already_processed: usize,
    pub processed: usize,
    pub notify_failures: usize,
    /// Set when the mailbox could not be read this round.
    pub error: Option<String>,
}

/// Outcome of a whole round, one entry per enabled account.
#[derive(Debug, Clone, Default)]
pub struct RoundReport {
    pub accounts: Vec<(String, AccountReport)>,
}

impl RoundReport {
    pub fn account(&self, email: &str) -> Option<&AccountReport> {
        self.accounts
            .iter()
            .find(|(e, _)| e == email)
            .map(|(_, r)| r)
    }

    pub fn fetched(&self) -> usize {
        self.accounts.iter().map(|(_, r)| r.fetched).sum()
    }

    pub fn processed(&self) -> usize {
        self.accounts.iter().map(|(_, r)| r.processed).sum()
    }

    pub fn notify_failures(&self) -> usize {
        self.accounts.iter().map(|(_, r)| r.notify_failures).sum()
    }

    pub fn failed_accounts(&self) -> usize {
        self.accounts.iter().filter(|(_, r)| r.error.is_some()).count()
    }
}

/// Drives polling rounds.
pub struct Scheduler {
    accounts: Vec<AccountConfig>,
    ledger: Arc<dyn Ledger>,
    fetcher: Arc<dyn MailboxFetcher>,
    classifier: Arc<Classifier>,
    notifier: Arc<Notifier>,
    pool: WorkerPool,
    clock: Arc<dyn Clock>,
    round_interval: Duration,
    message_interval: Duration,
}

impl Scheduler {
    pub fn new(
        accounts: Vec<AccountConfig>,
        ledger: Arc<dyn Ledger>,
        fetcher: Arc<dyn MailboxFetcher>,
        classifier: Arc<Classifier>,
        notifier: Arc<Notifier>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            accounts,
            ledger,
            fetcher,
            classifier,
            notifier,
            pool,
            clock: Arc::new(SystemClock::new()),
            round_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            message_interval: Duration::from_millis(DEFAULT_MESSAGE_INTERVAL_MILLIS),
        }
    }

    /// Sleep between rounds and minimum spacing of outbound calls per account.
    pub fn with_intervals(mut self, round: Duration, message: Duration) -> Self {
        self.round_interval = round;
        self.message_interval = message;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Execute exactly one round.
    pub async fn run_once(self: &Arc<Self>) -> RoundReport {
        let (_keep_open, shutdown) = watch::channel(false);
        let report = self.run_round(&shutdown).await;
        log_round(&report);
        report
    }

    /// Run rounds until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            accounts = self.enabled_accounts().count(),
            interval_secs = self.round_interval.as_secs(),
            "Scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let report = self.run_round(&shutdown).await;
            log_round(&report);

            tokio::select! {
                _ = self.clock.sleep(self.round_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }

    /// One round: every enabled account concurrently.
    pub async fn run_round(self: &Arc<Self>, shutdown: &watch::Receiver<bool>) -> RoundReport {
        let mut tasks = JoinSet::new();
        for account in self.enabled_accounts().cloned() {
            let this = Arc::clone(self);
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                let report = this.process_account(&account, &shutdown).await;
                (account.email, report)
            });
        }

        let mut round = RoundReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => round.accounts.push(entry),
                Err(e) => error!(error = %e, "Account task panicked"),
            }
        }
        round
    }

    fn enabled_accounts(&self) -> impl Iterator<Item = &AccountConfig> {
        self.accounts.iter().filter(|a| a.enabled)
    }

    async fn process_account(
        &self,
        account: &AccountConfig,
        shutdown: &watch::Receiver<bool>,
    ) -> AccountReport {
        let mut report = AccountReport::default();
        debug!(account = %account.email, alias = %account.alias, "Checking mailbox");

        let fetched = match self.fetch(account).await {
            Ok(messages) => messages,
            Err(e) => {
                error!(account = %account.email, alias = %account.alias, error = %e, "Mailbox check failed");
                report.error = Some(e.to_string());
                return report;
            }
        };
        report.fetched = fetched.len();

        let mut pending = Vec::with_capacity(fetched.len());
        for message in fetched {
            match self.ledger.is_processed(&account.email, &message.uid).await {
                Ok(true) => report.already_processed += 1,
                Ok(false) => pending.push(message),
                Err(e) => warn!(
                    account = %account.email,
                    uid = %message.uid,
                    error = %e,
                    "Ledger lookup failed, leaving message for the next round"
                ),
            }
        }

        if pending.is_empty() {
            debug!(alias = %account.alias, "No new mail");
            return report;
        }
        info!(alias = %account.alias, count = pending.len(), "New mail found");

        let limiter = RateLimiter::new(self.message_interval, Arc::clone(&self.clock));
        let mut shutdown = shutdown.clone();
        for message in pending {
            if *shutdown.borrow() {
                info!(alias = %account.alias, "Shutdown requested, stopping account pass");
                break;
            }
            let step = self
                .handle_message(account, &message, &limiter, &mut shutdown, &mut report)
                .await;
            if step.is_break() {
                info!(alias = %account.alias, "Shutdown requested, stopping account pass");
                break;
            }
        }
        report
    }

    async fn fetch(&self, account: &AccountConfig) -> Result<Vec<MailMessage>, MailboxError> {
        let fetcher = Arc::clone(&self.fetcher);
        let account = account.clone();
        self.pool
            .run_blocking(move || fetcher.fetch_unread(&account))
            .await?
    }

    /// classify → notify → record for one message.
    ///
    /// Shutdown during classification leaves the message unrecorded for the
    /// next run. Shutdown during notification abandons the card but still
    /// records the message. Either way the account pass stops.
    async fn handle_message(
        &self,
        account: &AccountConfig,
        message: &MailMessage,
        limiter: &RateLimiter,
        shutdown: &mut watch::Receiver<bool>,
        report: &mut AccountReport,
    ) -> ControlFlow<()> {
        let input = classification_input(message);
        let outcome = tokio::select! {
            outcome = self.classifier.classify(&input, limiter) => outcome,
            () = shutdown_requested(shutdown) => {
                info!(
                    alias = %account.alias,
                    uid = %message.uid,
                    "Classification interrupted, message left for the next run"
                );
                return ControlFlow::Break(());
            }
        };
        if let Classification::Degraded { error, .. } = &outcome {
            warn!(alias = %account.alias, uid = %message.uid, error = %error, "Classification degraded");
        }
        let result = outcome.into_result();

        let mut flow = ControlFlow::Continue(());
        tokio::select! {
            delivered = self.notifier.notify(message, &result, account, limiter) => {
                if let Err(e) = delivered {
                    report.notify_failures += 1;
                    warn!(alias = %account.alias, uid = %message.uid, error = %e, "Notification failed");
                }
            }
            () = shutdown_requested(shutdown) => {
                report.notify_failures += 1;
                warn!(
                    alias = %account.alias,
                    uid = %message.uid,
                    "Notification interrupted by shutdown"
                );
                flow = ControlFlow::Break(());
            }
        }

        match self
            .ledger
            .record(&account.email, &account.alias, &message.uid, &result)
            .await
        {
            Ok(_) => {
                report.processed += 1;
                info!(
                    alias = %account.alias,
                    uid = %message.uid,
                    category = %result.category,
                    subject = %message.subject,
                    "Message processed"
                );
            }
            Err(e) => error!(
                account = %account.email,
                uid = %message.uid,
                error = %e,
                "Failed to record processed message"
            ),
        }
        flow
    }
}

/// Resolves once shutdown is requested. A dropped sender never resolves.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let closed = shutdown.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Text handed to the classifier.
fn classification_input(message: &MailMessage) -> String {
    format!(
        "Subject: {}\nFrom: {}\n\n{}",
        message.subject, message.sender, message.body
    )
}

fn log_round(report: &RoundReport) {
    info!(
        accounts = report.accounts.len(),
        failed_accounts = report.failed_accounts(),
        fetched = report.fetched(),
        processed = report.processed(),
        notify_failures = report.notify_failures(),
        "Round complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_report_totals() {
        let report = RoundReport {
            accounts: vec![
                (
                    "a@x".into(),
                    AccountReport {
                        fetched: 3,
                        already_processed: 1,
                        processed: 2,
                        notify_failures: 1,
                        error: None,
                    },
                ),
                (
                    "b@x".into(),
                    AccountReport {
                        error: Some("auth".into()),
                        ..Default::default()
                    },
                ),
            ],
        };
        assert_eq!(report.fetched(), 3);
        assert_eq!(report.processed(), 2);
        assert_eq!(report.notify_failures(), 1);
        assert_eq!(report.failed_accounts(), 1);
        assert_eq!(report.account("a@x").unwrap().already_processed, 1);
        assert!(report.account("c@x").is_none());
    }

    #[test]
    fn classifier_sees_subject_and_sender() {
        let message = MailMessage {
            account_email: "a@x".into(),
            uid: "1".into(),
            subject: "Hi".into(),
            sender: "s@y".into(),
            body: "body".into(),
        };
        assert_eq!(classification_input(&message), "Subject: Hi\nFrom: s@y\n\nbody");
    }
}
