use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use mail_gateway::channels::imap::ImapFetcher;
use mail_gateway::config::{
    DEFAULT_CONFIG_PATH, DEFAULT_DB_PATH, DEFAULT_LOG_DIR, GatewayConfig, JsonFilePreferences,
};
use mail_gateway::llm::{LlmConfig, create_backend};
use mail_gateway::pipeline::classifier::Classifier;
use mail_gateway::pipeline::notifier::{Notifier, ReqwestTransport};
use mail_gateway::pipeline::scheduler::Scheduler;
use mail_gateway::store::{Ledger, LibSqlLedger};
use mail_gateway::worker::WorkerPool;

const LOG_FILE: &str = "mail_gateway.log";

#[derive(Parser, Debug)]
#[command(name = "mail-gateway", version)]
#[command(about = "Poll mailboxes, classify new mail with Gemini, push Feishu cards", long_about = None)]
struct Cli {
    /// Configuration document
    #[arg(long, env = "MAIL_GATEWAY_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Ledger database file
    #[arg(long, env = "MAIL_GATEWAY_DB_PATH", default_value = DEFAULT_DB_PATH)]
    db: PathBuf,

    /// Directory for the daily log file
    #[arg(long, env = "MAIL_GATEWAY_LOG_DIR", default_value = DEFAULT_LOG_DIR)]
    log_dir: PathBuf,

    /// Run a single round and exit
    #[arg(long)]
    once: bool,

    /// Print recently processed messages and exit
    #[arg(long)]
    list: bool,

    /// Number of records shown by --list
    #[arg(long, default_value_t = 15)]
    limit: usize,

    /// Post a test card to the configured webhook and exit
    #[arg(long)]
    test_webhook: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Install rustls crypto provider before any TLS usage
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    let _log_guard = init_tracing(&cli.log_dir);

    if cli.list {
        list_history(&cli.db, cli.limit).await;
        return;
    }

    let config = GatewayConfig::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  Pass --config <path> or set MAIL_GATEWAY_CONFIG");
        std::process::exit(1);
    });

    let pool = WorkerPool::new(config.worker_pool_size);

    let transport = ReqwestTransport::new(config.use_proxy.as_ref()).unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });
    let notifier = Arc::new(Notifier::new(
        Arc::new(transport),
        config.webhook().map(str::to_string),
        pool.clone(),
    ));

    if cli.test_webhook {
        match notifier.send_test_card().await {
            Ok(()) => eprintln!("✅ Test card delivered"),
            Err(e) => {
                eprintln!("❌ Test card failed: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = config.require_enabled_account() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    if !notifier.is_enabled() {
        tracing::warn!("feishu_webhook not set, messages will be recorded without notification");
    }

    let backend = match config.api_key() {
        Some(key) => {
            let llm_config = LlmConfig::new(key.clone()).with_proxy(config.use_proxy.clone());
            Some(create_backend(&llm_config).unwrap_or_else(|e| {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }))
        }
        None => {
            tracing::warn!("gemini_api_key not set, messages will be recorded as unclassified");
            None
        }
    };
    let classifier = Arc::new(Classifier::new(
        backend,
        Arc::new(JsonFilePreferences::new(cli.config.clone())),
        pool.clone(),
        config.system_prompt(),
    ));

    let ledger = LibSqlLedger::new_local(&cli.db).await.unwrap_or_else(|e| {
        eprintln!("Error: Failed to open ledger at {}: {e}", cli.db.display());
        std::process::exit(1);
    });

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        accounts = config.enabled_accounts().count(),
        ledger = %cli.db.display(),
        "Mail gateway starting"
    );

    let scheduler = Arc::new(
        Scheduler::new(
            config.accounts.clone(),
            Arc::new(ledger),
            Arc::new(ImapFetcher::new()),
            classifier,
            notifier,
            pool,
        )
        .with_intervals(config.poll_interval(), config.message_interval()),
    );

    if cli.once {
        scheduler.run_once().await;
        return;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupt received, shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot listen for interrupt");
                // Keep the sender alive so the scheduler keeps running.
                std::future::pending::<()>().await;
                drop(shutdown_tx);
            }
        }
    });

    scheduler.run(shutdown_rx).await;
}

/// Console plus a daily-rotated file. The guard must outlive `main`'s work.
fn init_tracing(log_dir: &Path) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE)
        .build(log_dir);

    match appender {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        Err(e) => {
            eprintln!("Warning: file logging disabled ({}): {e}", log_dir.display());
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
            None
        }
    }
}

async fn list_history(db_path: &Path, limit: usize) {
    let ledger = LibSqlLedger::new_local(db_path).await.unwrap_or_else(|e| {
        eprintln!("Error: Failed to open ledger at {}: {e}", db_path.display());
        std::process::exit(1);
    });
    let records = ledger.recent_history(limit).await.unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    if records.is_empty() {
        println!("No processed messages yet.");
        return;
    }

    println!("{:<19} | {:<12} | {:<10} | summary", "time", "alias", "category");
    println!("{}", "-".repeat(72));
    for record in records {
        let summary: String = record
            .summary
            .as_deref()
            .unwrap_or("")
            .chars()
            .take(40)
            .collect();
        println!(
            "{:<19} | {:<12} | {:<10} | {}",
            record.processed_at.format("%Y-%m-%d %H:%M:%S"),
            record.alias.as_deref().unwrap_or("-"),
            record.category.as_deref().unwrap_or("-"),
            summary
        );
    }
}
