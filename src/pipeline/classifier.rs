//! Classifier: turns message content into a `ClassificationResult`.
//!
//! Never fails: every failure path yields a degraded result together with
//! the recovered `ClassificationError`, and the caller decides what to do.
//!
//! Model selection:
//! 1. A model stored in the preference store is tried first.
//! 2. Otherwise, on first use only, the backend's model list is intersected
//!    with the built-in ranking and the first hit is persisted.
//! 3. Any call or parse failure falls through to the next candidate.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::config::{PreferenceStore, Preferences};
use crate::error::ClassificationError;
use crate::llm::ModelBackend;
use crate::pipeline::rate_limit::RateLimiter;
use crate::pipeline::types::{Classification, ClassificationResult};
use crate::worker::WorkerPool;

/// Built-in model ranking, most preferred first.
pub const DEFAULT_CANDIDATE_MODELS: &[&str] = &[
    "gemini-2.5-flash",
    "gemini-2.0-flash",
    "gemini-1.5-flash-latest",
    "gemini-1.5-flash",
    "gemini-pro",
];

/// Content beyond this many characters is dropped before submission.
pub const MAX_CONTENT_CHARS: usize = 3000;

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*\s*(.*?)\s*```\s*$").expect("valid fence regex")
});

/// Language-model classifier with ranked fallback and one-time discovery.
pub struct Classifier {
    backend: Option<Arc<dyn ModelBackend>>,
    preferences: Arc<dyn PreferenceStore>,
    pool: WorkerPool,
    system_prompt: String,
    builtin_models: Vec<String>,
    /// Resolved candidate ranking; filled once per classifier.
    candidates: OnceCell<Vec<String>>,
}

impl Classifier {
    /// `backend` is `None` when no API key is configured.
    pub fn new(
        backend: Option<Arc<dyn ModelBackend>>,
        preferences: Arc<dyn PreferenceStore>,
        pool: WorkerPool,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            preferences,
            pool,
            system_prompt: system_prompt.into(),
            builtin_models: DEFAULT_CANDIDATE_MODELS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            candidates: OnceCell::new(),
        }
    }

    pub fn with_builtin_models(mut self, models: Vec<String>) -> Self {
        self.builtin_models = models;
        self
    }

    /// Candidate ranking, if it has been resolved yet.
    pub fn resolved_candidates(&self) -> Option<&[String]> {
        self.candidates.get().map(Vec::as_slice)
    }

    /// Classify `content`. Every backend call waits on `limiter` first.
    pub async fn classify(&self, content: &str, limiter: &RateLimiter) -> Classification {
        let Some(backend) = &self.backend else {
            debug!("No model API key configured, skipping classification");
            return Classification::Degraded {
                result: ClassificationResult::not_configured(),
                error: ClassificationError::NotConfigured,
            };
        };

        let candidates = self
            .candidates
            .get_or_init(|| self.resolve_candidates(backend.as_ref(), limiter))
            .await;

        let prompt = build_prompt(&self.system_prompt, content);
        let mut attempts: Vec<(String, String)> = Vec::new();

        for model in candidates {
            limiter.acquire().await;
            let reply = match self.pool.run(backend.generate(model, &prompt)).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    warn!(model = %model, error = %e, "Model call failed, trying next candidate");
                    attempts.push((model.clone(), e.to_string()));
                    continue;
                }
                Err(e) => {
                    warn!(model = %model, error = %e, "Model call could not be scheduled");
                    attempts.push((model.clone(), e.to_string()));
                    continue;
                }
            };

            match parse_classification(&reply) {
                Ok(result) => {
                    debug!(model = %model, category = %result.category, "Classified message");
                    return Classification::Classified {
                        result,
                        model: model.clone(),
                    };
                }
                Err(e) => {
                    warn!(
                        model = %model,
                        raw_response = %reply.chars().take(200).collect::<String>(),
                        error = %e,
                        "Unparsable model reply, trying next candidate"
                    );
                    attempts.push((model.clone(), e));
                }
            }
        }

        let error = ClassificationError::Exhausted { attempts };
        error!(error = %error, "Classification failed on every candidate model");
        Classification::Degraded {
            result: ClassificationResult::ai_error(),
            error,
        }
    }

    /// Build the candidate ranking. Runs at most once per classifier.
    async fn resolve_candidates(
        &self,
        backend: &dyn ModelBackend,
        limiter: &RateLimiter,
    ) -> Vec<String> {
        let store = Arc::clone(&self.preferences);
        let preferences = match self.pool.run_blocking(move || store.load_preferences()).await {
            Ok(Ok(prefs)) => prefs,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to load model preference");
                Preferences::default()
            }
            Err(e) => {
                warn!(error = %e, "Preference load could not be scheduled");
                Preferences::default()
            }
        };

        if let Some(model) = preferences.model {
            info!(model = %model, "Using configured model");
            return rank(Some(&model), &self.builtin_models);
        }

        limiter.acquire().await;
        let available = match self.pool.run(backend.list_models()).await {
            Ok(Ok(models)) => models,
            Ok(Err(e)) => {
                warn!(error = %e, "Model discovery failed, using built-in ranking");
                return self.builtin_models.clone();
            }
            Err(e) => {
                warn!(error = %e, "Model discovery could not be scheduled");
                return self.builtin_models.clone();
            }
        };

        let Some(found) = discover(&self.builtin_models, &available) else {
            warn!(
                available = available.len(),
                "No built-in model offered by backend, using built-in ranking"
            );
            return self.builtin_models.clone();
        };

        info!(model = %found, "Discovered model");
        let store = Arc::clone(&self.preferences);
        let update = Preferences {
            model: Some(found.clone()),
        };
        match self.pool.run_blocking(move || store.save_preferences(&update)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to persist discovered model"),
            Err(e) => warn!(error = %e, "Preference save could not be scheduled"),
        }
        rank(Some(&found), &self.builtin_models)
    }
}

// ── Helpers (public for testing) ────────────────────────────────────

/// Put `preferred` first, followed by the built-ins minus duplicates.
pub fn rank(preferred: Option<&str>, builtin: &[String]) -> Vec<String> {
    let mut ranked: Vec<String> = preferred.map(|m| vec![m.to_string()]).unwrap_or_default();
    for model in builtin {
        if !ranked.contains(model) {
            ranked.push(model.clone());
        }
    }
    ranked
}

/// First built-in model (in rank order) that the backend offers.
pub fn discover(builtin: &[String], available: &[String]) -> Option<String> {
    builtin
        .iter()
        .find(|candidate| {
            available
                .iter()
                .any(|a| a.trim_start_matches("models/") == candidate.as_str())
        })
        .cloned()
}

/// Build the prompt; content is silently cut to `MAX_CONTENT_CHARS`.
pub fn build_prompt(system_prompt: &str, content: &str) -> String {
    let truncated: String = content.chars().take(MAX_CONTENT_CHARS).collect();
    format!("{system_prompt}\nEmail Content: {truncated}\nOutput JSON ONLY.")
}

/// Remove a surrounding markdown code fence, if any.
pub fn strip_code_fences(raw: &str) -> &str {
    match CODE_FENCE.captures(raw).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str(),
        None => raw.trim(),
    }
}

/// Parse a model reply into a `ClassificationResult`.
pub fn parse_classification(raw: &str) -> Result<ClassificationResult, String> {
    let body = strip_code_fences(raw);
    if let Ok(result) = serde_json::from_str::<ClassificationResult>(body) {
        return Ok(result);
    }

    // Prose around the object: fall back to the outermost braces.
    match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => {
            serde_json::from_str(&body[start..=end]).map_err(|e| format!("JSON parse error: {e}"))
        }
        _ => Err("no JSON object in model reply".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::config::MemoryPreferences;
    use crate::error::LlmError;
    use crate::pipeline::rate_limit::ManualClock;
    use crate::pipeline::types::AI_ERROR_CATEGORY;

    const GOOD_REPLY: &str = "```json\n{\"category\":\"账单\",\"summary\":\"Invoice\",\"priority\":2}\n```";

    /// Scripted backend: per-model replies, counted calls.
    #[derive(Default)]
    struct StubBackend {
        available: Vec<String>,
        list_fails: bool,
        replies: HashMap<String, Result<String, String>>,
        list_calls: AtomicUsize,
        generate_calls: Mutex<Vec<String>>,
    }

    impl StubBackend {
        fn offering(models: &[&str]) -> Self {
            Self {
                available: models.iter().map(|m| format!("models/{m}")).collect(),
                ..Default::default()
            }
        }

        fn reply(mut self, model: &str, reply: Result<&str, &str>) -> Self {
            self.replies.insert(
                model.to_string(),
                reply.map(str::to_string).map_err(str::to_string),
            );
            self
        }

        fn calls(&self) -> Vec<String> {
            self.generate_calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ModelBackend for StubBackend {
        async fn list_models(&self) -> Result<Vec<String>, LlmError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.list_fails {
                return Err(LlmError::AuthFailed);
            }
            Ok(self.available.clone())
        }

        async fn generate(&self, model: &str, _prompt: &str) -> Result<String, LlmError> {
            self.generate_calls.lock().unwrap().push(model.to_string());
            match self.replies.get(model) {
                Some(Ok(text)) => Ok(text.clone()),
                Some(Err(reason)) => Err(LlmError::RequestFailed {
                    model: model.to_string(),
                    reason: reason.clone(),
                }),
                None => Err(LlmError::ModelNotAvailable {
                    model: model.to_string(),
                }),
            }
        }
    }

    fn limiter() -> RateLimiter {
        RateLimiter::new(Duration::ZERO, Arc::new(ManualClock::new()))
    }

    fn classifier(
        backend: Arc<StubBackend>,
        prefs: Arc<MemoryPreferences>,
    ) -> Classifier {
        Classifier::new(Some(backend), prefs, WorkerPool::new(2), "classify")
            .with_builtin_models(vec!["m1".into(), "m2".into(), "m3".into()])
    }

    #[tokio::test]
    async fn not_configured_short_circuits() {
        let c = Classifier::new(
            None,
            Arc::new(MemoryPreferences::default()),
            WorkerPool::new(1),
            "p",
        );
        let out = c.classify("hello", &limiter()).await;
        assert!(out.is_degraded());
        assert!(matches!(
            out,
            Classification::Degraded {
                error: ClassificationError::NotConfigured,
                ..
            }
        ));
        assert!(c.resolved_candidates().is_none());
    }

    #[tokio::test]
    async fn discovery_adopts_first_ranked_match_and_persists_it() {
        let backend = Arc::new(StubBackend::offering(&["m3", "m2"]).reply("m2", Ok(GOOD_REPLY)));
        let prefs = Arc::new(MemoryPreferences::default());
        let c = classifier(backend.clone(), prefs.clone());

        let out = c.classify("Invoice attached", &limiter()).await;

        match out {
            Classification::Classified { result, model } => {
                assert_eq!(model, "m2");
                assert_eq!(result.category, "账单");
            }
            other => panic!("expected classified, got {other:?}"),
        }
        assert_eq!(c.resolved_candidates().unwrap(), ["m2", "m1", "m3"]);
        assert_eq!(prefs.save_count(), 1);
        assert_eq!(
            prefs.load_preferences().unwrap().model.as_deref(),
            Some("m2")
        );
    }

    #[tokio::test]
    async fn discovery_runs_once_per_classifier() {
        let backend = Arc::new(StubBackend::offering(&["m1"]).reply("m1", Ok(GOOD_REPLY)));
        let prefs = Arc::new(MemoryPreferences::default());
        let c = classifier(backend.clone(), prefs.clone());

        c.classify("one", &limiter()).await;
        c.classify("two", &limiter()).await;

        assert_eq!(backend.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(prefs.save_count(), 1);
    }

    #[tokio::test]
    async fn independent_classifiers_have_independent_discovery() {
        let backend = Arc::new(StubBackend::offering(&["m1"]).reply("m1", Ok(GOOD_REPLY)));
        let a = classifier(backend.clone(), Arc::new(MemoryPreferences::default()));
        let b = classifier(backend.clone(), Arc::new(MemoryPreferences::default()));

        a.classify("x", &limiter()).await;
        b.classify("y", &limiter()).await;

        assert_eq!(backend.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stored_preference_skips_discovery() {
        let backend = Arc::new(StubBackend::offering(&["m1"]).reply("custom", Ok(GOOD_REPLY)));
        let prefs = Arc::new(MemoryPreferences::new(Preferences {
            model: Some("custom".into()),
        }));
        let c = classifier(backend.clone(), prefs.clone());

        let out = c.classify("x", &limiter()).await;

        assert!(!out.is_degraded());
        assert_eq!(backend.list_calls.load(Ordering::SeqCst), 0);
        assert_eq!(prefs.save_count(), 0);
        assert_eq!(c.resolved_candidates().unwrap(), ["custom", "m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn failures_fall_through_in_rank_order() {
        let backend = Arc::new(
            StubBackend::offering(&["m1", "m2", "m3"])
                .reply("m1", Err("quota exceeded"))
                .reply("m2", Ok("I think this is spam."))
                .reply("m3", Ok(GOOD_REPLY)),
        );
        let c = classifier(backend.clone(), Arc::new(MemoryPreferences::default()));

        let out = c.classify("x", &limiter()).await;

        assert!(matches!(out, Classification::Classified { ref model, .. } if model == "m3"));
        assert_eq!(backend.calls(), vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn exhausted_candidates_degrade_to_ai_error() {
        let backend = Arc::new(StubBackend {
            list_fails: true,
            ..Default::default()
        });
        let c = classifier(backend.clone(), Arc::new(MemoryPreferences::default()));

        let out = c.classify("x", &limiter()).await;

        assert_eq!(out.result().category, AI_ERROR_CATEGORY);
        assert_eq!(out.result().priority, 1);
        match out {
            Classification::Degraded {
                error: ClassificationError::Exhausted { attempts },
                ..
            } => assert_eq!(attempts.len(), 3),
            other => panic!("expected exhausted, got {other:?}"),
        }
        // Failed discovery falls back to the built-in ranking.
        assert_eq!(c.resolved_candidates().unwrap(), ["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn every_backend_call_is_rate_limited() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(Duration::from_secs(1), clock.clone());
        let backend = Arc::new(
            StubBackend::offering(&["m1"])
                .reply("m1", Err("boom"))
                .reply("m2", Ok(GOOD_REPLY)),
        );
        let c = classifier(backend, Arc::new(MemoryPreferences::default()));

        c.classify("x", &limiter).await;

        // list_models + m1 + m2: the first is free, the next two wait.
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1); 2]);
    }

    #[test]
    fn rank_dedups_preferred_model() {
        let builtin = vec!["a".to_string(), "b".to_string()];
        assert_eq!(rank(Some("b"), &builtin), vec!["b", "a"]);
        assert_eq!(rank(None, &builtin), vec!["a", "b"]);
    }

    #[test]
    fn discover_respects_rank_not_backend_order() {
        let builtin = vec!["a".to_string(), "b".to_string()];
        let available = vec!["models/b".to_string(), "models/a".to_string()];
        assert_eq!(discover(&builtin, &available).as_deref(), Some("a"));
        assert_eq!(discover(&builtin, &["models/z".to_string()]), None);
    }

    #[test]
    fn prompt_truncates_content() {
        let long = "字".repeat(MAX_CONTENT_CHARS + 500);
        let prompt = build_prompt("SYS", &long);
        assert!(prompt.starts_with("SYS\nEmail Content: "));
        assert!(prompt.ends_with("\nOutput JSON ONLY."));
        assert_eq!(prompt.chars().filter(|c| *c == '字').count(), MAX_CONTENT_CHARS);
    }

    #[test]
    fn strip_fences_variants() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[test]
    fn parse_handles_prose_and_garbage() {
        let r =
            parse_classification("Sure! {\"category\":\"广告\",\"priority\":1} Hope that helps")
                .unwrap();
        assert_eq!(r.category, "广告");
        assert!(parse_classification("no json here").is_err());
        assert!(parse_classification("{broken").is_err());
    }
}
