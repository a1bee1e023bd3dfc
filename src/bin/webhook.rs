//! Reset, delete or inspect the bot's webhook on demand.
//!
//! Usage: cargo run --bin webhook [config.json] [reset|delete|info]
//!
//! `reset` (the default) deletes the current webhook, sets it to
//! `<webhook_base_url>/api/bot` and prints what the platform reports back.
//! Always exits 0 once the config is loaded; results are in the log.

use tracing::{error, info};

use hookline::config::Config;
use hookline::logging::{self, Sinks};
use hookline::webhook::{Registrar, RegistrationOutcome, TelegramApi};

enum Action {
    Reset,
    Delete,
    Info,
}

impl Action {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "reset" | "set" => Some(Action::Reset),
            "delete" => Some(Action::Delete),
            "info" | "get" => Some(Action::Info),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = args.first().cloned().unwrap_or_else(|| "hookline.json".to_string());
    let action = match args.get(1).map(String::as_str) {
        None => Action::Reset,
        Some(s) => match Action::parse(s) {
            Some(action) => action,
            None => {
                eprintln!("Unknown action '{s}'. Use reset, delete or info.");
                std::process::exit(2);
            }
        },
    };

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    let _guard = logging::init(&config, "webhook.log", Sinks::Local);

    let desired = match config.desired_webhook() {
        Ok(d) => d,
        Err(e) => {
            error!("Cannot manage webhook: {e}");
            return;
        }
    };
    let api = match TelegramApi::new(
        desired.token.clone(),
        config.api_base_url.clone(),
        config.request_timeout,
    ) {
        Ok(api) => api,
        Err(e) => {
            error!("Cannot manage webhook: {e}");
            return;
        }
    };
    let registrar = Registrar::new(&api, &desired);

    match action {
        Action::Reset => match registrar.reconcile().await {
            RegistrationOutcome::Registered { url, .. } => {
                info!("Webhook set successfully: {url}");
            }
            RegistrationOutcome::Skipped { reason } => info!("Webhook unchanged: {reason}"),
            RegistrationOutcome::Failed { phase, error } => {
                error!("Webhook reset failed during {phase:?}: {error}");
            }
        },
        Action::Delete => {
            // Failure is already logged by the registrar.
            let _ = registrar.delete().await;
        }
        Action::Info => {
            registrar.observe().await;
        }
    }
}
