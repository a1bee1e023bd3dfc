//! Webhook lifecycle: the Bot API calls and the registrar built on them.

pub mod client;
pub mod registrar;

pub use client::{ApiError, BotApi, BotIdentity, TelegramApi, WebhookRemoteState};
pub use registrar::{Phase, Registrar, RegistrationOutcome, register_on_startup};
