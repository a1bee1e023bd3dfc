//! Bot API client for the webhook lifecycle calls.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::config::bot_id_of;

/// Who the token belongs to. Only used for diagnostics.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BotIdentity {
    pub id: i64,
    #[serde(default)]
    pub username: String,
}

/// Snapshot of `getWebhookInfo`. Empty `url` means no webhook is set.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct WebhookRemoteState {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub pending_update_count: u32,
    #[serde(default)]
    pub last_error_message: Option<String>,
    /// Unix time of `last_error_message`.
    #[serde(default)]
    pub last_error_date: Option<i64>,
}

impl WebhookRemoteState {
    pub fn is_set(&self) -> bool {
        !self.url.is_empty()
    }

    pub fn last_error_at(&self) -> Option<DateTime<Utc>> {
        self.last_error_date.and_then(|ts| DateTime::from_timestamp(ts, 0))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiError {
    /// Network, DNS, TLS or timeout failure. The request may not have arrived.
    Transport(String),
    /// The platform answered and refused, or answered with something unusable.
    Remote { code: i64, message: String },
}

impl ApiError {
    /// Whether the caller may retry. The client itself never does.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport(_) => true,
            ApiError::Remote { code, .. } => *code == 429 || *code >= 500,
        }
    }

    /// The platform does not know the method we called: a permanent defect.
    pub fn is_missing_endpoint(&self) -> bool {
        matches!(self, ApiError::Remote { code: 404, .. })
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Transport(e) => write!(f, "transport error: {e}"),
            ApiError::Remote { code, message } => write!(f, "remote API error {code}: {message}"),
        }
    }
}

impl std::error::Error for ApiError {}

/// The four remote calls the webhook lifecycle needs.
///
/// Implementations are bound to one bot token. None of them cache or retry.
pub trait BotApi: Send + Sync {
    fn get_identity(&self) -> impl Future<Output = Result<BotIdentity, ApiError>> + Send;

    fn get_webhook_state(&self) -> impl Future<Output = Result<WebhookRemoteState, ApiError>> + Send;

    /// Point the platform at `url`. `secret_token` is echoed back by the
    /// platform in a header on every delivery.
    fn set_webhook(
        &self,
        url: &Url,
        secret_token: Option<&str>,
    ) -> impl Future<Output = Result<bool, ApiError>> + Send;

    /// Succeeds when no webhook is set.
    fn delete_webhook(&self) -> impl Future<Output = Result<bool, ApiError>> + Send;
}

#[derive(Deserialize)]
struct Envelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
}

/// reqwest-backed client for `<api_base>/bot<token>/<method>`.
pub struct TelegramApi {
    token: String,
    api_base: Url,
    http: reqwest::Client,
}

impl TelegramApi {
    pub fn new(token: impl Into<String>, api_base: Url, timeout: Duration) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ApiError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            token: token.into(),
            api_base,
            http,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.api_base.as_str().trim_end_matches('/'),
            self.token,
            method
        )
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, query: &str) -> Result<T, ApiError> {
        let mut url = self.method_url(method);
        if !query.is_empty() {
            url.push('?');
            url.push_str(query);
        }

        debug!(
            "Calling {} for bot {}",
            method,
            bot_id_of(&self.token).unwrap_or("?")
        );

        // Error text from reqwest embeds the URL, which embeds the token.
        let response = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|e| ApiError::Transport(describe_transport(method, e)))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ApiError::Transport(describe_transport(method, e)))?;

        decode_envelope(method, status, &body)
    }
}

fn describe_transport(method: &str, e: reqwest::Error) -> String {
    let kind = if e.is_timeout() {
        "timed out"
    } else if e.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    format!("{method} {kind}: {}", e.without_url())
}

fn decode_envelope<T: DeserializeOwned>(
    method: &str,
    status: StatusCode,
    body: &[u8],
) -> Result<T, ApiError> {
    let envelope: Envelope<T> = serde_json::from_slice(body).map_err(|e| ApiError::Remote {
        code: status.as_u16() as i64,
        message: format!("{method}: malformed response: {e}"),
    })?;

    if !envelope.ok {
        return Err(ApiError::Remote {
            code: envelope.error_code.unwrap_or(status.as_u16() as i64),
            message: envelope
                .description
                .unwrap_or_else(|| format!("{method} failed without description")),
        });
    }

    envelope.result.ok_or_else(|| ApiError::Remote {
        code: status.as_u16() as i64,
        message: format!("{method}: response has no result field"),
    })
}

impl BotApi for TelegramApi {
    async fn get_identity(&self) -> Result<BotIdentity, ApiError> {
        self.call("getMe", "").await
    }

    async fn get_webhook_state(&self) -> Result<WebhookRemoteState, ApiError> {
        self.call("getWebhookInfo", "").await
    }

    async fn set_webhook(&self, url: &Url, secret_token: Option<&str>) -> Result<bool, ApiError> {
        let mut query = format!("url={}", urlencoding::encode(url.as_str()));
        if let Some(secret) = secret_token {
            query.push_str("&secret_token=");
            query.push_str(&urlencoding::encode(secret));
        }
        self.call("setWebhook", &query).await
    }

    async fn delete_webhook(&self) -> Result<bool, ApiError> {
        self.call("deleteWebhook", "").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_success() {
        let body = br#"{"ok":true,"result":{"id":7,"is_bot":true,"username":"parser_bot"}}"#;
        let me: BotIdentity = decode_envelope("getMe", StatusCode::OK, body).unwrap();
        assert_eq!(me.username, "parser_bot");
        assert_eq!(me.id, 7);
    }

    #[test]
    fn test_decode_remote_rejection_uses_error_code() {
        let body = br#"{"ok":false,"error_code":400,"description":"Bad Request: bad webhook: An HTTPS URL must be provided for webhook"}"#;
        let err = decode_envelope::<bool>("setWebhook", StatusCode::BAD_REQUEST, body).unwrap_err();
        match err {
            ApiError::Remote { code, ref message } => {
                assert_eq!(code, 400);
                assert!(message.contains("HTTPS URL"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_decode_missing_result_is_remote_error() {
        let err = decode_envelope::<bool>("deleteWebhook", StatusCode::OK, br#"{"ok":true}"#)
            .unwrap_err();
        assert!(matches!(err, ApiError::Remote { code: 200, .. }));
    }

    #[test]
    fn test_decode_not_json() {
        let err = decode_envelope::<bool>("getMe", StatusCode::BAD_GATEWAY, b"<html>")
            .unwrap_err();
        assert!(matches!(err, ApiError::Remote { code: 502, .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_missing_endpoint_is_permanent() {
        let body = br#"{"ok":false,"error_code":404,"description":"Not Found"}"#;
        let err = decode_envelope::<bool>("deleteWebhookInfo", StatusCode::NOT_FOUND, body)
            .unwrap_err();
        assert!(err.is_missing_endpoint());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_webhook_state_defaults() {
        let body = br#"{"ok":true,"result":{"url":"","has_custom_certificate":false,"pending_update_count":0}}"#;
        let state: WebhookRemoteState =
            decode_envelope("getWebhookInfo", StatusCode::OK, body).unwrap();
        assert!(!state.is_set());
        assert_eq!(state.last_error_message, None);
        assert_eq!(state.last_error_at(), None);
    }

    #[test]
    fn test_webhook_state_last_error() {
        let body = br#"{"ok":true,"result":{"url":"https://bot.example.com/api/bot","pending_update_count":3,
            "last_error_date":1767232800,"last_error_message":"Connection refused"}}"#;
        let state: WebhookRemoteState =
            decode_envelope("getWebhookInfo", StatusCode::OK, body).unwrap();
        assert_eq!(state.pending_update_count, 3);
        assert_eq!(state.last_error_message.as_deref(), Some("Connection refused"));
        assert_eq!(
            state.last_error_at().unwrap().to_rfc3339(),
            "2026-01-01T02:00:00+00:00"
        );
    }

    #[test]
    fn test_method_url() {
        let api = TelegramApi::new(
            "123:abc",
            Url::parse("https://api.telegram.org/").unwrap(),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(api.method_url("getMe"), "https://api.telegram.org/bot123:abc/getMe");
    }
}
