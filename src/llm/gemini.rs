//! Gemini REST backend.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::LlmError;
use crate::llm::ModelBackend;

/// Public Generative Language API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

const API_KEY_HEADER: &str = "x-goog-api-key";
const GENERATE_METHOD: &str = "generateContent";
const MAX_LIST_PAGES: usize = 10;

/// Gemini model backend.
pub struct GeminiBackend {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
}

impl GeminiBackend {
    pub fn new(client: reqwest::Client, api_key: SecretString, base_url: &str) -> Self {
        Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn models_url(&self) -> String {
        format!("{}/v1beta/models", self.base_url)
    }

    fn generate_url(&self, model: &str) -> String {
        format!("{}/v1beta/models/{model}:{GENERATE_METHOD}", self.base_url)
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelInfo>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelInfo {
    name: String,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

/// Model identifiers that support text generation, `models/` prefix removed.
fn generative_models(list: &ModelList) -> impl Iterator<Item = String> + '_ {
    list.models
        .iter()
        .filter(|m| m.supported_generation_methods.iter().any(|g| g == GENERATE_METHOD))
        .map(|m| m.name.trim_start_matches("models/").to_string())
}

/// Concatenate the text parts of the first candidate.
fn first_candidate_text(model: &str, response: GenerateResponse) -> Result<String, LlmError> {
    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(LlmError::InvalidResponse {
            model: model.to_string(),
            reason: "response contained no text candidate".into(),
        });
    }
    Ok(text)
}

/// Map a non-success HTTP status to an `LlmError`.
fn status_error(model: &str, status: reqwest::StatusCode, body: &str) -> LlmError {
    let snippet: String = body.chars().take(300).collect();
    match status.as_u16() {
        401 | 403 => LlmError::AuthFailed,
        404 => LlmError::ModelNotAvailable {
            model: model.to_string(),
        },
        429 => LlmError::RateLimited {
            model: model.to_string(),
        },
        code => LlmError::RequestFailed {
            model: model.to_string(),
            reason: format!("HTTP {code}: {snippet}"),
        },
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl ModelBackend for GeminiBackend {
    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let mut models = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let mut request = self
                .client
                .get(self.models_url())
                .header(API_KEY_HEADER, self.api_key.expose_secret())
                .query(&[("pageSize", "1000")]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(status_error("*", status, &body));
            }

            let page: ModelList = response.json().await?;
            models.extend(generative_models(&page));
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        tracing::debug!(count = models.len(), "Listed Gemini models");
        Ok(models)
    }

    async fn generate(&self, model: &str, prompt: &str) -> Result<String, LlmError> {
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });

        let response = self
            .client
            .post(self.generate_url(model))
            .header(API_KEY_HEADER, self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(model, status, &text));
        }

        let parsed: GenerateResponse =
            response
                .json()
                .await
                .map_err(|e| LlmError::InvalidResponse {
                    model: model.to_string(),
                    reason: e.to_string(),
                })?;
        first_candidate_text(model, parsed)
    }
}
