use reqwest::Url;
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use teloxide::types::ChatId;

use crate::ingress::INGRESS_PATH;

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Validation error.
    Validation(String),
    /// No bot token configured; webhook registration and ingress are disabled.
    MissingToken,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
            Self::MissingToken => write!(f, "bot token not configured"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::Validation(_) | Self::MissingToken => None,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    /// Optional so the service can still boot (and answer 500) without one.
    telegram_bot_token: Option<String>,
    /// Externally reachable base URL, e.g. "https://bot.example.com".
    #[serde(default = "default_base_url")]
    webhook_base_url: String,
    #[serde(default = "default_true")]
    require_https: bool,
    /// Sent to the platform as `secret_token` and checked on every delivery.
    webhook_secret: Option<String>,
    #[serde(default = "default_listen_addr")]
    listen_addr: String,
    #[serde(default = "default_api_base_url")]
    api_base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    request_timeout_secs: u64,
    /// Only one instance of a scaled-out deployment should register.
    #[serde(default = "default_true")]
    register_on_start: bool,
    #[serde(default = "default_timezone")]
    timezone: String,
    refresh_cron: Option<String>,
    cleanup_cron: Option<String>,
    #[serde(default = "default_job_queue_capacity")]
    job_queue_capacity: usize,
    log_chat_id: Option<i64>,
    /// Directory for state files (logs). Defaults to current directory.
    data_dir: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_api_base_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_job_queue_capacity() -> usize {
    64
}

/// What the Registrar wants the remote webhook to look like.
#[derive(Debug, Clone)]
pub struct WebhookDesiredState {
    pub token: String,
    /// Fully qualified callback: base URL + ingress path.
    pub target_url: Url,
    pub require_secure_transport: bool,
    pub secret_token: Option<String>,
}

impl WebhookDesiredState {
    /// False when policy demands https and the target is anything else.
    pub fn transport_allowed(&self) -> bool {
        !self.require_secure_transport || self.target_url.scheme() == "https"
    }
}

pub struct Config {
    pub telegram_bot_token: Option<String>,
    pub webhook_base_url: Url,
    pub require_https: bool,
    pub webhook_secret: Option<String>,
    pub listen_addr: SocketAddr,
    pub api_base_url: Url,
    pub request_timeout: Duration,
    pub register_on_start: bool,
    pub timezone: chrono_tz::Tz,
    /// Overrides for the maintenance cadences (7-field cron).
    pub refresh_cron: Option<String>,
    pub cleanup_cron: Option<String>,
    pub job_queue_capacity: usize,
    pub log_chat_id: Option<ChatId>,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    /// Load from file, letting `BOT_TOKEN` / `WEBHOOK_URL` from `env` win.
    pub fn load_with_env<P, F>(path: P, env: F) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
        F: Fn(&str) -> Option<String>,
    {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let mut file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        if let Some(token) = env("BOT_TOKEN").filter(|t| !t.is_empty()) {
            file.telegram_bot_token = Some(token);
        }
        if let Some(url) = env("WEBHOOK_URL").filter(|u| !u.is_empty()) {
            file.webhook_base_url = url;
        }

        Self::from_file(file)
    }

    fn from_file(file: ConfigFile) -> Result<Self, ConfigError> {
        let telegram_bot_token = file.telegram_bot_token.filter(|t| !t.is_empty());
        if let Some(ref token) = telegram_bot_token {
            validate_token(token)?;
        }

        let webhook_base_url = Url::parse(file.webhook_base_url.trim_end_matches('/'))
            .map_err(|e| {
                ConfigError::Validation(format!(
                    "webhook_base_url '{}' is not a valid URL: {e}",
                    file.webhook_base_url
                ))
            })?;
        if !matches!(webhook_base_url.scheme(), "http" | "https") {
            return Err(ConfigError::Validation(format!(
                "webhook_base_url must be http or https, got '{}'",
                webhook_base_url.scheme()
            )));
        }
        // The ingress path is appended to the base, so there must be nothing after it.
        if webhook_base_url.query().is_some() || webhook_base_url.fragment().is_some() {
            return Err(ConfigError::Validation(format!(
                "webhook_base_url '{}' must not carry a query or fragment",
                file.webhook_base_url
            )));
        }

        let webhook_secret = file.webhook_secret.filter(|s| !s.is_empty());
        if let Some(ref secret) = webhook_secret {
            let valid = secret.len() <= 256
                && secret.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if !valid {
                return Err(ConfigError::Validation(
                    "webhook_secret must be 1-256 characters of A-Z, a-z, 0-9, _ and -".into(),
                ));
            }
        }

        let listen_addr = file.listen_addr.parse::<SocketAddr>().map_err(|e| {
            ConfigError::Validation(format!("listen_addr '{}' is invalid: {e}", file.listen_addr))
        })?;

        let api_base_url = Url::parse(file.api_base_url.trim_end_matches('/')).map_err(|e| {
            ConfigError::Validation(format!("api_base_url '{}' is invalid: {e}", file.api_base_url))
        })?;

        if file.request_timeout_secs == 0 {
            return Err(ConfigError::Validation("request_timeout_secs must be positive".into()));
        }
        if file.job_queue_capacity == 0 {
            return Err(ConfigError::Validation("job_queue_capacity must be positive".into()));
        }

        let timezone = chrono_tz::Tz::from_str(&file.timezone).map_err(|_| {
            ConfigError::Validation(format!("unknown timezone '{}'", file.timezone))
        })?;

        for expr in file.refresh_cron.iter().chain(file.cleanup_cron.iter()) {
            cron::Schedule::from_str(expr).map_err(|e| {
                ConfigError::Validation(format!("invalid cron expression '{expr}': {e}"))
            })?;
        }

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            telegram_bot_token,
            webhook_base_url,
            require_https: file.require_https,
            webhook_secret,
            listen_addr,
            api_base_url,
            request_timeout: Duration::from_secs(file.request_timeout_secs),
            register_on_start: file.register_on_start,
            timezone,
            refresh_cron: file.refresh_cron,
            cleanup_cron: file.cleanup_cron,
            job_queue_capacity: file.job_queue_capacity,
            log_chat_id: file.log_chat_id.map(ChatId),
            data_dir,
        })
    }

    /// Base URL + ingress path, e.g. "https://bot.example.com/api/bot".
    pub fn callback_url(&self) -> Result<Url, ConfigError> {
        let joined = format!(
            "{}{}",
            self.webhook_base_url.as_str().trim_end_matches('/'),
            INGRESS_PATH
        );
        Url::parse(&joined)
            .map_err(|e| ConfigError::Validation(format!("callback url '{joined}' is invalid: {e}")))
    }

    pub fn desired_webhook(&self) -> Result<WebhookDesiredState, ConfigError> {
        let token = self.telegram_bot_token.clone().ok_or(ConfigError::MissingToken)?;
        Ok(WebhookDesiredState {
            token,
            target_url: self.callback_url()?,
            require_secure_transport: self.require_https,
            secret_token: self.webhook_secret.clone(),
        })
    }

    /// Numeric bot id (the part of the token before ':'), safe to log.
    pub fn bot_id(&self) -> Option<&str> {
        self.telegram_bot_token.as_deref().and_then(bot_id_of)
    }
}

pub fn bot_id_of(token: &str) -> Option<&str> {
    token.split_once(':').map(|(id, _)| id)
}

fn validate_token(token: &str) -> Result<(), ConfigError> {
    // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
    let token_parts: Vec<&str> = token.split(':').collect();
    if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
        return Err(ConfigError::Validation(
            "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into(),
        ));
    }
    Ok(())
}
