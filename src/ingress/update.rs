//! The update handed to the application, and the application seam itself.

use std::future::Future;

use axum::body::Bytes;
use teloxide::prelude::*;
use teloxide::types::UpdateKind;
use tracing::info;

/// One decoded delivery. Moved into the application; never kept here.
pub struct InboundUpdate {
    pub raw: Bytes,
    pub envelope: serde_json::Value,
    /// Bot the update was delivered to, for replying.
    pub bot: Bot,
}

impl InboundUpdate {
    pub fn update_id(&self) -> Option<i64> {
        self.envelope.get("update_id").and_then(|v| v.as_i64())
    }

    /// Typed view of the delivery. `None` when it does not match the
    /// platform's update schema (e.g. `{}`); the raw envelope is still valid.
    ///
    /// Decoded from the raw bytes: teloxide's `UpdateKind` only recognizes
    /// update kinds when deserialized from a JSON reader, not from a `Value`.
    pub fn decode(&self) -> Option<Update> {
        serde_json::from_slice(&self.raw).ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppError(pub String);

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "application error: {}", self.0)
    }
}

impl std::error::Error for AppError {}

/// Update processing logic living outside the ingress.
pub trait Application: Send + Sync + 'static {
    /// One-time setup. The ingress calls it at most once per successful run.
    fn initialize(&self) -> impl Future<Output = Result<(), AppError>> + Send;

    fn process_update(&self, update: InboundUpdate) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Logs what arrives. Stands in until a real handler is wired up.
#[derive(Default)]
pub struct LoggingApplication;

impl Application for LoggingApplication {
    async fn initialize(&self) -> Result<(), AppError> {
        info!("Update application initialized");
        Ok(())
    }

    async fn process_update(&self, update: InboundUpdate) -> Result<(), AppError> {
        let id = update.update_id();
        match update.decode() {
            Some(typed) => info!("📨 Update {:?}: {}", id, describe(&typed)),
            None => info!("📨 Update {:?}: unrecognized envelope ({} bytes)", id, update.raw.len()),
        }
        Ok(())
    }
}

fn describe(update: &Update) -> String {
    match &update.kind {
        UpdateKind::Message(msg) => format!("message in chat {}", msg.chat.id),
        UpdateKind::EditedMessage(msg) => format!("edited message in chat {}", msg.chat.id),
        UpdateKind::CallbackQuery(q) => format!("callback query from {}", q.from.id),
        UpdateKind::ChatMember(m) => format!("chat member update in {}", m.chat.id),
        UpdateKind::Error(_) => "unknown update kind".to_string(),
        _ => "other update".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(json: &str) -> InboundUpdate {
        InboundUpdate {
            raw: Bytes::copy_from_slice(json.as_bytes()),
            envelope: serde_json::from_str(json).unwrap(),
            bot: Bot::new("1:test"),
        }
    }

    #[test]
    fn test_empty_envelope_has_no_id_or_typed_view() {
        let u = update("{}");
        assert_eq!(u.update_id(), None);
        assert!(u.decode().is_none());
    }

    #[test]
    fn test_message_envelope_decodes() {
        let u = update(
            r#"{"update_id":10,"message":{"message_id":1,"date":1700000000,
                "chat":{"id":42,"type":"private","first_name":"A"},
                "from":{"id":42,"is_bot":false,"first_name":"A"},"text":"/start"}}"#,
        );
        assert_eq!(u.update_id(), Some(10));
        let typed = u.decode().expect("valid message update");
        assert_eq!(describe(&typed), "message in chat 42");
    }

    #[test]
    fn test_callback_query_envelope_decodes() {
        let u = update(
            r#"{"update_id":11,"callback_query":{"id":"7","chat_instance":"c",
                "from":{"id":9,"is_bot":false,"first_name":"B"},"data":"x"}}"#,
        );
        let typed = u.decode().expect("valid callback update");
        assert_eq!(describe(&typed), "callback query from 9");
    }
}
