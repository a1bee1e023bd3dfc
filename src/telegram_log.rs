//! Forwards warnings and errors to an operator chat.

use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::ChatId;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// Pending lines beyond this are dropped; the layer never blocks the caller.
const CHANNEL_CAPACITY: usize = 256;

/// Telegram caps message text at 4096 characters.
const MAX_MESSAGE_CHARS: usize = 4000;

pub struct TelegramLogLayer {
    tx: mpsc::Sender<String>,
}

impl TelegramLogLayer {
    /// Must be called inside a tokio runtime.
    pub fn new(bot: Bot, chat_id: ChatId) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            // Collect a burst (e.g. a failed reconciliation logs several lines)
            // into one message.
            while let Some(first) = rx.recv().await {
                let mut batch = vec![first];
                let window = tokio::time::sleep(Duration::from_secs(2));
                tokio::pin!(window);
                loop {
                    tokio::select! {
                        _ = &mut window => break,
                        next = rx.recv() => match next {
                            Some(line) => batch.push(line),
                            None => break,
                        },
                    }
                }
                send_log(&bot, chat_id, &batch.join("\n")).await;
            }
        });

        Self { tx }
    }
}

async fn send_log(bot: &Bot, chat_id: ChatId, text: &str) {
    let text = if text.chars().count() > MAX_MESSAGE_CHARS {
        let truncated: String = text.chars().take(MAX_MESSAGE_CHARS).collect();
        format!("{}...", truncated)
    } else {
        text.to_string()
    };
    if let Err(e) = bot.send_message(chat_id, &text).await {
        // Not through tracing: that would loop back into this layer.
        eprintln!("Failed to send log to Telegram: {e}");
    }
}

struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else if self.message.is_empty() {
            self.message = format!("{} = {:?}", field.name(), value);
        } else {
            self.message
                .push_str(&format!(", {} = {:?}", field.name(), value));
        }
    }
}

fn format_line(level: Level, target: &str, message: &str) -> String {
    let icon = if level == Level::ERROR { "❌" } else { "⚠️" };
    format!("{icon} [{target}] {message}")
}

impl<S: Subscriber> Layer<S> for TelegramLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = *metadata.level();
        if level > Level::WARN {
            return;
        }
        // teloxide/reqwest failures while sending would feed back into us.
        if !metadata.target().starts_with(env!("CARGO_CRATE_NAME")) {
            return;
        }

        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);

        let line = format_line(level, metadata.target(), &visitor.message);
        if let Err(mpsc::error::TrySendError::Closed(_)) = self.tx.try_send(line) {
            eprintln!("Log channel closed, message dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_line() {
        assert_eq!(
            format_line(Level::WARN, "hookline::webhook::registrar", "skipping"),
            "⚠️ [hookline::webhook::registrar] skipping"
        );
        assert!(format_line(Level::ERROR, "t", "m").starts_with("❌"));
    }
}
