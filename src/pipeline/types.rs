//! Shared types for the polling pipeline.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ClassificationError;

/// Category substituted when every classification attempt failed.
pub const AI_ERROR_CATEGORY: &str = "AI Error";

/// Category substituted when no model API key is configured.
pub const NOT_CONFIGURED_CATEGORY: &str = "未配置AI";

// ── Fetched mail ────────────────────────────────────────────────────

/// One unread message fetched from a mailbox. Lives for a single
/// processing step; only its classification outcome is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub account_email: String,
    /// Mailbox-assigned unique identifier.
    pub uid: String,
    pub subject: String,
    pub sender: String,
    pub body: String,
}

// ── Classification ──────────────────────────────────────────────────

/// Structured categorization of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationResult {
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_summary")]
    pub summary: String,
    #[serde(default = "default_priority", deserialize_with = "lenient_priority")]
    pub priority: i64,
    #[serde(default, deserialize_with = "lenient_code")]
    pub verification_code: Option<String>,
}

fn default_category() -> String {
    "其他".to_string()
}

fn default_summary() -> String {
    "无摘要".to_string()
}

fn default_priority() -> i64 {
    1
}

/// Accept `5`, `4.0` or `"3"`; anything else becomes the default. Clamped to 1..=5.
fn lenient_priority<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let parsed = match &value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    Ok(parsed.unwrap_or_else(default_priority).clamp(1, 5))
}

/// Accept a string or a number; `null` and blanks become `None`.
fn lenient_code<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

impl ClassificationResult {
    /// Degraded result used when every candidate model failed.
    pub fn ai_error() -> Self {
        Self {
            category: AI_ERROR_CATEGORY.to_string(),
            summary: "解析失败".to_string(),
            priority: 1,
            verification_code: None,
        }
    }

    /// Degraded result used when no API key is configured.
    pub fn not_configured() -> Self {
        Self {
            category: NOT_CONFIGURED_CATEGORY.to_string(),
            summary: "未配置 Gemini API Key".to_string(),
            priority: 1,
            verification_code: None,
        }
    }

    /// Verification code worth displaying, ignoring a literal `"null"`.
    pub fn display_code(&self) -> Option<&str> {
        self.verification_code
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty() && !c.eq_ignore_ascii_case("null"))
    }
}

/// What `Classifier::classify` hands back: always a usable result, plus the
/// recovered error when the result is a degraded substitute.
#[derive(Debug)]
pub enum Classification {
    Classified {
        result: ClassificationResult,
        model: String,
    },
    Degraded {
        result: ClassificationResult,
        error: ClassificationError,
    },
}

impl Classification {
    pub fn result(&self) -> &ClassificationResult {
        match self {
            Self::Classified { result, .. } | Self::Degraded { result, .. } => result,
        }
    }

    pub fn into_result(self) -> ClassificationResult {
        match self {
            Self::Classified { result, .. } | Self::Degraded { result, .. } => result,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}
