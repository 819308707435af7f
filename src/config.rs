//! Configuration types.
//!
//! The gateway reads one JSON document (`config.json` by default). Account
//! credentials are loaded once at startup and never reloaded. The only thing
//! ever written back is the discovered model preference, through
//! [`PreferenceStore`], which touches the `gemini_model` key and nothing else.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::ConfigError;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Default ledger database path.
pub const DEFAULT_DB_PATH: &str = "mail_gateway.db";

/// Default log directory.
pub const DEFAULT_LOG_DIR: &str = "logs";

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 20;
pub const DEFAULT_MESSAGE_INTERVAL_MILLIS: u64 = 2000;
pub const DEFAULT_WORKER_POOL_SIZE: usize = 10;
const DEFAULT_IMAP_PORT: u16 = 993;
const DEFAULT_LOOKBACK_DAYS: u32 = 7;

/// Prompt used when the configuration does not carry one.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an email triage assistant. Read the email and reply with a single JSON object:\n\
{\"category\": \"<short label, e.g. 验证码 / 重要通知 / 账单 / 广告 / 其他>\", \
\"summary\": \"<one sentence summary>\", \
\"priority\": <integer 1-5, 5 is most urgent>, \
\"verification_code\": \"<the code if the email carries a login or verification code, otherwise null>\"}";

// ── Document ────────────────────────────────────────────────────────

/// The whole configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub gemini_api_key: Option<SecretString>,
    #[serde(default)]
    pub feishu_webhook: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub use_proxy: Option<ProxySetting>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_message_interval_millis")]
    pub message_interval_millis: u64,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
}

/// One watched mailbox.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub email: String,
    #[serde(default = "default_alias")]
    pub alias: String,
    pub imap_server: String,
    pub password: SecretString,
    #[serde(default = "default_folder")]
    pub folder: String,
    /// Explicit IMAP port; `host:port` in `imap_server` wins over this.
    #[serde(default)]
    pub port: Option<u16>,
    /// Trailing window for the "recent unread" safety-net search.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// `use_proxy` accepts either a flag or an explicit proxy URL.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ProxySetting {
    /// `true` honours `HTTP(S)_PROXY` from the environment, `false` disables proxies.
    Enabled(bool),
    Url(String),
}

fn default_alias() -> String {
    "Unknown".to_string()
}

fn default_folder() -> String {
    "INBOX".to_string()
}

fn default_lookback_days() -> u32 {
    DEFAULT_LOOKBACK_DAYS
}

fn default_enabled() -> bool {
    true
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_message_interval_millis() -> u64 {
    DEFAULT_MESSAGE_INTERVAL_MILLIS
}

fn default_worker_pool_size() -> usize {
    DEFAULT_WORKER_POOL_SIZE
}

impl GatewayConfig {
    /// Load and validate the configuration document at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_json(&raw)
    }

    /// Parse and validate a configuration document.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "worker_pool_size".into(),
                message: "must be at least 1".into(),
            });
        }
        for (i, account) in self.accounts.iter().enumerate() {
            if account.email.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    key: format!("accounts[{i}].email"),
                    hint: "Every account needs a login address.".into(),
                });
            }
            if account.imap_server.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    key: format!("accounts[{i}].imap_server"),
                    hint: "Set the IMAP host, e.g. imap.gmail.com.".into(),
                });
            }
        }
        Ok(())
    }

    /// Accounts the scheduler will poll.
    pub fn enabled_accounts(&self) -> impl Iterator<Item = &AccountConfig> {
        self.accounts.iter().filter(|a| a.enabled)
    }

    /// Polling needs at least one enabled account.
    pub fn require_enabled_account(&self) -> Result<(), ConfigError> {
        if self.enabled_accounts().next().is_none() {
            return Err(ConfigError::MissingRequired {
                key: "accounts".into(),
                hint: "Add an account or set \"enabled\": true on one.".into(),
            });
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn message_interval(&self) -> Duration {
        Duration::from_millis(self.message_interval_millis)
    }

    /// Non-empty webhook URL, if configured.
    pub fn webhook(&self) -> Option<&str> {
        self.feishu_webhook
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Non-blank model API key, if configured.
    pub fn api_key(&self) -> Option<&SecretString> {
        self.gemini_api_key
            .as_ref()
            .filter(|k| !k.expose_secret().trim().is_empty())
    }

    pub fn system_prompt(&self) -> &str {
        self.system_prompt
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }
}

impl AccountConfig {
    /// Resolve `(host, port)` from `imap_server`, which may carry `host:port`.
    pub fn imap_endpoint(&self) -> (String, u16) {
        let server = self.imap_server.trim();
        if let Some((host, port)) = server.rsplit_once(':')
            && let Ok(port) = port.parse::<u16>()
        {
            return (host.to_string(), port);
        }
        (server.to_string(), self.port.unwrap_or(DEFAULT_IMAP_PORT))
    }
}

/// Build a `reqwest::Client` honouring the proxy setting.
pub fn http_client(
    proxy: Option<&ProxySetting>,
    timeout: Duration,
) -> Result<reqwest::Client, ConfigError> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    match proxy {
        Some(ProxySetting::Enabled(false)) => builder = builder.no_proxy(),
        Some(ProxySetting::Url(url)) => {
            let proxy = reqwest::Proxy::all(url).map_err(|e| ConfigError::InvalidValue {
                key: "use_proxy".into(),
                message: e.to_string(),
            })?;
            builder = builder.proxy(proxy);
        }
        Some(ProxySetting::Enabled(true)) | None => {}
    }
    builder.build().map_err(|e| ConfigError::InvalidValue {
        key: "use_proxy".into(),
        message: format!("failed to build HTTP client: {e}"),
    })
}

// ── Model preference store ──────────────────────────────────────────

/// Persisted model preference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preferences {
    pub model: Option<String>,
}

/// Load/save capability for the model preference, decoupled from the rest
/// of the configuration so the classifier's write-back is observable.
///
/// Implementations may block; callers run them on the worker pool.
pub trait PreferenceStore: Send + Sync {
    fn load_preferences(&self) -> Result<Preferences, ConfigError>;

    fn save_preferences(&self, update: &Preferences) -> Result<(), ConfigError>;
}

/// Preference store backed by the `gemini_model` key of the JSON config file.
pub struct JsonFilePreferences {
    path: PathBuf,
}

impl JsonFilePreferences {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_document(&self) -> Result<serde_json::Value, ConfigError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(self.path.clone())
            } else {
                ConfigError::Io(e)
            }
        })?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

impl PreferenceStore for JsonFilePreferences {
    fn load_preferences(&self) -> Result<Preferences, ConfigError> {
        let doc = self.read_document()?;
        let model = doc
            .get("gemini_model")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Ok(Preferences { model })
    }

    fn save_preferences(&self, update: &Preferences) -> Result<(), ConfigError> {
        let mut doc = self.read_document()?;
        let Some(obj) = doc.as_object_mut() else {
            return Err(ConfigError::Parse(
                "configuration root is not a JSON object".into(),
            ));
        };
        match &update.model {
            Some(model) => {
                obj.insert("gemini_model".into(), serde_json::Value::String(model.clone()));
            }
            None => {
                obj.remove("gemini_model");
            }
        }

        let rendered =
            serde_json::to_string_pretty(&doc).map_err(|e| ConfigError::Parse(e.to_string()))?;
        // The file carries credentials: the replacement keeps the original mode.
        let permissions = std::fs::metadata(&self.path)?.permissions();
        let tmp = self.path.with_extension("json.tmp");
        let mut file = std::fs::File::create(&tmp)?;
        file.set_permissions(permissions)?;
        file.write_all(rendered.as_bytes())?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, &self.path)?;
        tracing::info!(path = %self.path.display(), model = ?update.model, "Saved model preference");
        Ok(())
    }
}

/// In-process preference store.
#[derive(Default)]
pub struct MemoryPreferences {
    inner: Mutex<Preferences>,
    saves: Mutex<usize>,
}

impl MemoryPreferences {
    pub fn new(initial: Preferences) -> Self {
        Self {
            inner: Mutex::new(initial),
            saves: Mutex::new(0),
        }
    }

    /// Number of `save_preferences` calls so far.
    pub fn save_count(&self) -> usize {
        self.saves.lock().map(|n| *n).unwrap_or(0)
    }
}

impl PreferenceStore for MemoryPreferences {
    fn load_preferences(&self) -> Result<Preferences, ConfigError> {
        self.inner
            .lock()
            .map(|p| p.clone())
            .map_err(|_| ConfigError::Parse("preference lock poisoned".into()))
    }

    fn save_preferences(&self, update: &Preferences) -> Result<(), ConfigError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| ConfigError::Parse("preference lock poisoned".into()))?;
        *inner = update.clone();
        if let Ok(mut saves) = self.saves.lock() {
            *saves += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    const SAMPLE: &str = r#"{
        "accounts": [
            {"email": "ops@example.com", "alias": "Ops", "imap_server": "imap.example.com", "password": "pw"},
            {"email": "me@example.com", "imap_server": "mail.example.com:1993", "password": "pw2", "folder": "Work"}
        ],
        "gemini_api_key": "key-123",
        "feishu_webhook": "https://open.feishu.cn/open-apis/bot/v2/hook/abc",
        "system_prompt": "classify"
    }"#;

    #[test]
    fn parses_accounts_with_defaults() {
        let config = GatewayConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.accounts.len(), 2);

        let ops = &config.accounts[0];
        assert_eq!(ops.alias, "Ops");
        assert_eq!(ops.folder, "INBOX");
        assert_eq!(ops.lookback_days, 7);
        assert!(ops.enabled);
        assert_eq!(ops.password.expose_secret(), "pw");

        let me = &config.accounts[1];
        assert_eq!(me.alias, "Unknown");
        assert_eq!(me.folder, "Work");

        assert_eq!(config.poll_interval(), Duration::from_secs(20));
        assert_eq!(config.message_interval(), Duration::from_millis(2000));
        assert_eq!(config.worker_pool_size, 10);
        assert_eq!(config.system_prompt(), "classify");
    }

    #[test]
    fn imap_endpoint_resolution() {
        let config = GatewayConfig::from_json(SAMPLE).unwrap();
        assert_eq!(
            config.accounts[0].imap_endpoint(),
            ("imap.example.com".to_string(), 993)
        );
        assert_eq!(
            config.accounts[1].imap_endpoint(),
            ("mail.example.com".to_string(), 1993)
        );
    }

    #[test]
    fn explicit_port_field() {
        let config = GatewayConfig::from_json(
            r#"{"accounts":[{"email":"a@b.c","imap_server":"imap.b.c","password":"x","port":143}]}"#,
        )
        .unwrap();
        assert_eq!(config.accounts[0].imap_endpoint(), ("imap.b.c".to_string(), 143));
    }

    #[test]
    fn proxy_setting_variants() {
        let flag = GatewayConfig::from_json(r#"{"use_proxy": false}"#).unwrap();
        assert_eq!(flag.use_proxy, Some(ProxySetting::Enabled(false)));

        let url = GatewayConfig::from_json(r#"{"use_proxy": "http://127.0.0.1:7890"}"#).unwrap();
        assert_eq!(
            url.use_proxy,
            Some(ProxySetting::Url("http://127.0.0.1:7890".into()))
        );
        assert!(http_client(url.use_proxy.as_ref(), Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn missing_email_is_rejected() {
        let err = GatewayConfig::from_json(
            r#"{"accounts":[{"email":" ","imap_server":"imap.b.c","password":"x"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));
    }

    #[test]
    fn polling_requires_an_enabled_account() {
        let none = GatewayConfig::from_json(r#"{"accounts": []}"#).unwrap();
        assert!(matches!(
            none.require_enabled_account(),
            Err(ConfigError::MissingRequired { key, .. }) if key == "accounts"
        ));

        let disabled = GatewayConfig::from_json(
            r#"{"accounts":[{"email":"a@b.c","imap_server":"imap.b.c","password":"x","enabled":false}]}"#,
        )
        .unwrap();
        assert!(disabled.require_enabled_account().is_err());

        let sample = GatewayConfig::from_json(SAMPLE).unwrap();
        assert!(sample.require_enabled_account().is_ok());
        assert_eq!(sample.enabled_accounts().count(), 2);
    }

    #[test]
    fn malformed_document_is_parse_error() {
        let err = GatewayConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = GatewayConfig::load(&tmp.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn blank_webhook_and_prompt_fall_back() {
        let config =
            GatewayConfig::from_json(r#"{"feishu_webhook": "  ", "system_prompt": ""}"#).unwrap();
        assert!(config.webhook().is_none());
        assert_eq!(config.system_prompt(), DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn file_preferences_write_back_preserves_other_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let store = JsonFilePreferences::new(&path);
        assert_eq!(store.load_preferences().unwrap(), Preferences::default());

        store
            .save_preferences(&Preferences {
                model: Some("gemini-2.0-flash".into()),
            })
            .unwrap();

        assert_eq!(
            store.load_preferences().unwrap().model.as_deref(),
            Some("gemini-2.0-flash")
        );
        let reloaded = GatewayConfig::load(&path).unwrap();
        assert_eq!(reloaded.accounts.len(), 2);
        assert_eq!(
            reloaded.webhook(),
            Some("https://open.feishu.cn/open-apis/bot/v2/hook/abc")
        );
    }

    #[test]
    fn file_preferences_write_back_keeps_key_order() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"zeta": 1, "accounts": [], "alpha": true}"#).unwrap();

        JsonFilePreferences::new(&path)
            .save_preferences(&Preferences {
                model: Some("gemini-2.0-flash".into()),
            })
            .unwrap();

        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let keys: Vec<&str> = doc.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys, ["zeta", "accounts", "alpha", "gemini_model"]);
    }

    #[cfg(unix)]
    #[test]
    fn file_preferences_write_back_keeps_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, SAMPLE).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();

        JsonFilePreferences::new(&path)
            .save_preferences(&Preferences {
                model: Some("gemini-2.0-flash".into()),
            })
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn memory_preferences_count_saves() {
        let store = MemoryPreferences::default();
        store
            .save_preferences(&Preferences {
                model: Some("m".into()),
            })
            .unwrap();
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.load_preferences().unwrap().model.as_deref(), Some("m"));
    }
}
