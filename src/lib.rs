//! Webhook lifecycle, update ingress and maintenance scheduling for a
//! Telegram bot service.

pub mod config;
pub mod ingress;
pub mod logging;
pub mod maintenance;
pub mod telegram_log;
pub mod webhook;
