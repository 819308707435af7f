//! Notifier: renders a classified message as a Feishu interactive card
//! and posts it to the configured webhook.
//!
//! Delivery is best effort: the scheduler logs a failed post and moves on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::config::{AccountConfig, ProxySetting, http_client};
use crate::error::{ConfigError, NotificationError};
use crate::pipeline::rate_limit::RateLimiter;
use crate::pipeline::types::{ClassificationResult, MailMessage};
use crate::worker::WorkerPool;

/// Categories that always render as urgent.
pub const URGENT_CATEGORIES: &[&str] = &["验证码", "重要通知"];

/// Priority at or above which a card renders as urgent.
pub const URGENT_PRIORITY: i64 = 4;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);
const FOOTER_BRAND: &str = "🤖 由 Mail-Gateway-Hub 驱动";

/// Outbound JSON POST.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post_json(&self, url: &str, payload: &Value) -> Result<(), NotificationError>;
}

/// `reqwest` transport with a bounded timeout.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(proxy: Option<&ProxySetting>) -> Result<Self, ConfigError> {
        Ok(Self {
            client: http_client(proxy, WEBHOOK_TIMEOUT)?,
        })
    }
}

#[async_trait]
impl WebhookTransport for ReqwestTransport {
    async fn post_json(&self, url: &str, payload: &Value) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| NotificationError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        check_response(status, &body)
    }
}

/// A 2xx is success unless the body carries a non-zero Feishu `code`.
pub fn check_response(status: u16, body: &str) -> Result<(), NotificationError> {
    if !(200..300).contains(&status) {
        return Err(NotificationError::Status {
            status,
            body: body.chars().take(300).collect(),
        });
    }
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return Ok(());
    };
    match parsed.get("code").and_then(Value::as_i64) {
        Some(code) if code != 0 => Err(NotificationError::Rejected {
            code,
            message: parsed
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        _ => Ok(()),
    }
}

/// Card notifier bound to one webhook.
pub struct Notifier {
    transport: Arc<dyn WebhookTransport>,
    webhook: Option<String>,
    pool: WorkerPool,
}

impl Notifier {
    /// `webhook` is `None` when notifications are disabled.
    pub fn new(
        transport: Arc<dyn WebhookTransport>,
        webhook: Option<String>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            transport,
            webhook,
            pool,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.webhook.is_some()
    }

    /// Post the card for one classified message. A missing webhook is a
    /// silent no-op.
    pub async fn notify(
        &self,
        message: &MailMessage,
        result: &ClassificationResult,
        account: &AccountConfig,
        limiter: &RateLimiter,
    ) -> Result<(), NotificationError> {
        let Some(url) = self.webhook.as_deref() else {
            tracing::debug!(uid = %message.uid, "No webhook configured, skipping notification");
            return Ok(());
        };
        let card = render_card(message, result, account);
        limiter.acquire().await;
        self.pool.run(self.transport.post_json(url, &card)).await??;
        tracing::debug!(
            account = %account.email,
            uid = %message.uid,
            urgent = is_urgent(result),
            "Card delivered"
        );
        Ok(())
    }

    /// Post the green self-test card. Errors are surfaced to the caller.
    pub async fn send_test_card(&self) -> Result<(), NotificationError> {
        let url = self
            .webhook
            .as_deref()
            .ok_or(NotificationError::NotConfigured)?;
        self.pool.run(self.transport.post_json(url, &test_card())).await??;
        Ok(())
    }
}

/// Urgent when the category is a designated label or priority is high.
pub fn is_urgent(result: &ClassificationResult) -> bool {
    URGENT_CATEGORIES.contains(&result.category.as_str()) || result.priority >= URGENT_PRIORITY
}

/// Build the interactive card payload.
pub fn render_card(
    message: &MailMessage,
    result: &ClassificationResult,
    account: &AccountConfig,
) -> Value {
    let template = if is_urgent(result) { "red" } else { "blue" };

    let mut content = format!(
        "**摘要**: {}\n**发件人**: {}",
        result.summary, message.sender
    );
    if let Some(code) = result.display_code() {
        content.push_str(&format!("\n\n**验证码**: <font color='red'>{code}</font>"));
    }

    json!({
        "msg_type": "interactive",
        "card": {
            "config": { "wide_screen_mode": true },
            "header": {
                "template": template,
                "title": {
                    "tag": "plain_text",
                    "content": format!("[{}] {}", account.alias, message.subject),
                },
            },
            "elements": [
                { "tag": "div", "text": { "tag": "lark_md", "content": content } },
                { "tag": "hr" },
                {
                    "tag": "note",
                    "elements": [{
                        "tag": "plain_text",
                        "content": format!(
                            "📍 身份: {} | 账号: {}\n{FOOTER_BRAND}",
                            account.alias, account.email
                        ),
                    }],
                },
            ],
        },
    })
}

fn test_card() -> Value {
    json!({
        "msg_type": "interactive",
        "card": {
            "config": { "wide_screen_mode": true },
            "header": {
                "template": "green",
                "title": { "tag": "plain_text", "content": "✅ Mail-Gateway-Hub 测试成功" },
            },
            "elements": [
                {
                    "tag": "div",
                    "text": { "tag": "lark_md", "content": "Webhook 连接正常，新邮件将推送到此群。" },
                },
                { "tag": "hr" },
                { "tag": "note", "elements": [{ "tag": "plain_text", "content": FOOTER_BRAND }] },
            ],
        },
    })
}
