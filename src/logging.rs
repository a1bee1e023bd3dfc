use teloxide::prelude::*;
use teloxide::types::ChatId;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

use crate::config::Config;
use crate::telegram_log;

/// Where log lines go besides stdout and the log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sinks {
    /// Long-running service: also forward warnings to the operator chat.
    Service,
    /// One-shot command: exits before a chat batch would be sent.
    Local,
}

/// Stdout + `<data_dir>/logs/<file_name>`, plus the operator chat for
/// [`Sinks::Service`] when `log_chat_id` and a token are configured.
/// Keep the guard alive.
pub fn init(config: &Config, file_name: &str, sinks: Sinks) -> WorkerGuard {
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let writer: Box<dyn std::io::Write + Send> = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(file_name))
    {
        Ok(file) => Box::new(file),
        Err(e) => {
            eprintln!("Failed to open log file in {}: {e}", log_dir.display());
            Box::new(std::io::sink())
        }
    };
    let (non_blocking, guard) = tracing_appender::non_blocking(writer);

    let registry = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        );

    match operator_chat(config, sinks) {
        Some((chat_id, token)) => {
            let bot = Bot::new(token).set_api_url(config.api_base_url.clone());
            registry
                .with(telegram_log::TelegramLogLayer::new(bot, chat_id))
                .init();
        }
        None => registry.init(),
    }

    guard
}

fn operator_chat(config: &Config, sinks: Sinks) -> Option<(ChatId, &str)> {
    if sinks == Sinks::Local {
        return None;
    }
    Some((config.log_chat_id?, config.telegram_bot_token.as_deref()?))
}
