//! Reconciles the platform's webhook pointer with our callback URL.

use reqwest::Url;
use tracing::{debug, error, info, warn};

use crate::config::{Config, WebhookDesiredState};
use crate::webhook::client::{ApiError, BotApi, BotIdentity, TelegramApi, WebhookRemoteState};

/// Where the reconciliation is. Logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Inspecting,
    Deleting,
    Setting,
    Skipping,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationOutcome {
    Registered {
        url: Url,
        bot: Option<BotIdentity>,
        observed: Option<WebhookRemoteState>,
    },
    /// Nothing was changed on the remote side.
    Skipped { reason: String },
    Failed { phase: Phase, error: ApiError },
}

pub struct Registrar<'a, A: BotApi> {
    api: &'a A,
    desired: &'a WebhookDesiredState,
    phase: Phase,
}

impl<'a, A: BotApi> Registrar<'a, A> {
    pub fn new(api: &'a A, desired: &'a WebhookDesiredState) -> Self {
        Self {
            api,
            desired,
            phase: Phase::Start,
        }
    }

    fn enter(&mut self, phase: Phase) {
        debug!("Webhook registrar: {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    /// Run one pass. Never fails: every problem ends up in the outcome and the log.
    pub async fn reconcile(mut self) -> RegistrationOutcome {
        self.enter(Phase::Inspecting);
        match self.api.get_webhook_state().await {
            Ok(state) => log_remote_state("Current webhook", &state),
            Err(e) => warn!("Could not read current webhook state: {e}"),
        }

        if !self.desired.transport_allowed() {
            self.enter(Phase::Skipping);
            let reason = format!("HTTPS URL required, got {}", self.desired.target_url);
            warn!("⚠️ Skipping webhook registration: {reason}");
            warn!("Expose the service over HTTPS (or a tunnel) and set webhook_base_url accordingly");
            self.enter(Phase::Done);
            return RegistrationOutcome::Skipped { reason };
        }

        self.enter(Phase::Deleting);
        if let Err(error) = self.api.delete_webhook().await {
            return self.fail(error);
        }

        self.enter(Phase::Setting);
        let desired = self.desired;
        let target = &desired.target_url;
        if let Err(error) = self
            .api
            .set_webhook(target, desired.secret_token.as_deref())
            .await
        {
            return self.fail(error);
        }
        info!("✅ Bot webhook reset to: {target}");

        let (bot, observed) = self.observe().await;
        self.enter(Phase::Done);
        RegistrationOutcome::Registered {
            url: target.clone(),
            bot,
            observed,
        }
    }

    /// Remove the webhook only, e.g. before switching to polling.
    pub async fn delete(mut self) -> Result<(), ApiError> {
        self.enter(Phase::Deleting);
        let result = self.api.delete_webhook().await;
        self.enter(Phase::Done);
        match result {
            Ok(_) => {
                info!("Webhook deleted");
                Ok(())
            }
            Err(e) => {
                log_failure(Phase::Deleting, &e);
                Err(e)
            }
        }
    }

    /// Identity and webhook state, logged. Errors are logged and swallowed.
    pub async fn observe(&self) -> (Option<BotIdentity>, Option<WebhookRemoteState>) {
        let bot = match self.api.get_identity().await {
            Ok(me) => {
                info!("Webhook bot: https://t.me/{} (id {})", me.username, me.id);
                Some(me)
            }
            Err(e) => {
                warn!("Failed to get bot info: {e}");
                None
            }
        };
        let observed = match self.api.get_webhook_state().await {
            Ok(state) => {
                log_remote_state("Webhook now", &state);
                if state.url != self.desired.target_url.as_str() {
                    warn!(
                        "Platform reports webhook '{}' but we registered '{}'",
                        state.url, self.desired.target_url
                    );
                }
                Some(state)
            }
            Err(e) => {
                warn!("Failed to get webhook info: {e}");
                None
            }
        };
        (bot, observed)
    }

    fn fail(mut self, error: ApiError) -> RegistrationOutcome {
        let phase = self.phase;
        log_failure(phase, &error);
        self.enter(Phase::Done);
        RegistrationOutcome::Failed { phase, error }
    }
}

/// Startup registration: best effort, never fatal. `None` when this
/// instance is not the registering one or the config rules it out.
pub async fn register_on_startup(config: &Config) -> Option<RegistrationOutcome> {
    if !config.register_on_start {
        info!("Webhook registration left to another instance (register_on_start = false)");
        return None;
    }
    let desired = match config.desired_webhook() {
        Ok(d) => d,
        Err(e) => {
            warn!("⚠️ Skipping webhook registration: {e}");
            return None;
        }
    };
    let api = match TelegramApi::new(
        desired.token.clone(),
        config.api_base_url.clone(),
        config.request_timeout,
    ) {
        Ok(api) => api,
        Err(e) => {
            warn!("⚠️ Skipping webhook registration: {e}");
            return None;
        }
    };

    let outcome = Registrar::new(&api, &desired).reconcile().await;
    if let RegistrationOutcome::Failed { phase, ref error } = outcome {
        warn!("Webhook not registered ({phase:?}: {error}); serving anyway, re-run the webhook command to retry");
    }
    Some(outcome)
}

fn log_failure(phase: Phase, error: &ApiError) {
    if error.is_missing_endpoint() {
        error!("Webhook {phase:?} hit a method the platform does not have: {error}");
    } else if error.is_retryable() {
        warn!("⚠️ Failed to reset bot webhook during {phase:?} (retryable): {error}");
    } else {
        warn!("⚠️ Failed to reset bot webhook during {phase:?}: {error}");
    }
}

fn log_remote_state(label: &str, state: &WebhookRemoteState) {
    if state.is_set() {
        info!(
            "{label}: {} ({} pending)",
            state.url, state.pending_update_count
        );
    } else {
        info!("{label}: none ({} pending)", state.pending_update_count);
    }
    if let Some(ref msg) = state.last_error_message {
        match state.last_error_at() {
            Some(at) => warn!("Platform reports last delivery error at {at}: {msg}"),
            None => warn!("Platform reports last delivery error: {msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory platform: keeps the webhook URL and records every call.
    #[derive(Default)]
    struct FakePlatform {
        url: Mutex<String>,
        calls: Mutex<Vec<String>>,
        fail_set: Option<ApiError>,
        fail_delete: Option<ApiError>,
    }

    impl FakePlatform {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }
    }

    impl BotApi for FakePlatform {
        async fn get_identity(&self) -> Result<BotIdentity, ApiError> {
            self.record("getMe");
            Ok(BotIdentity { id: 1, username: "parser_bot".into() })
        }

        async fn get_webhook_state(&self) -> Result<WebhookRemoteState, ApiError> {
            self.record("getWebhookInfo");
            Ok(WebhookRemoteState {
                url: self.url.lock().unwrap().clone(),
                ..Default::default()
            })
        }

        async fn set_webhook(&self, url: &Url, _secret: Option<&str>) -> Result<bool, ApiError> {
            self.record("setWebhook");
            if let Some(ref e) = self.fail_set {
                return Err(e.clone());
            }
            *self.url.lock().unwrap() = url.to_string();
            Ok(true)
        }

        async fn delete_webhook(&self) -> Result<bool, ApiError> {
            self.record("deleteWebhook");
            if let Some(ref e) = self.fail_delete {
                return Err(e.clone());
            }
            self.url.lock().unwrap().clear();
            Ok(true)
        }
    }

    fn desired(url: &str, require_https: bool) -> WebhookDesiredState {
        WebhookDesiredState {
            token: "1:abc".into(),
            target_url: Url::parse(url).unwrap(),
            require_secure_transport: require_https,
            secret_token: None,
        }
    }

    #[tokio::test]
    async fn test_http_target_is_skipped_without_mutation() {
        let platform = FakePlatform::default();
        *platform.url.lock().unwrap() = "https://old.example.com/api/bot".into();
        let want = desired("http://localhost:8000/api/bot", true);

        let outcome = Registrar::new(&platform, &want).reconcile().await;

        assert!(matches!(outcome, RegistrationOutcome::Skipped { .. }));
        assert_eq!(platform.calls(), vec!["getWebhookInfo"]);
        assert_eq!(*platform.url.lock().unwrap(), "https://old.example.com/api/bot");
    }

    #[tokio::test]
    async fn test_http_target_allowed_when_policy_off() {
        let platform = FakePlatform::default();
        let want = desired("http://localhost:8000/api/bot", false);

        let outcome = Registrar::new(&platform, &want).reconcile().await;

        assert!(matches!(outcome, RegistrationOutcome::Registered { .. }));
    }

    #[tokio::test]
    async fn test_https_target_is_registered_exactly() {
        let platform = FakePlatform::default();
        let want = desired("https://bot.example.com/api/bot", true);

        let outcome = Registrar::new(&platform, &want).reconcile().await;

        match outcome {
            RegistrationOutcome::Registered { url, bot, observed } => {
                assert_eq!(url.as_str(), "https://bot.example.com/api/bot");
                assert_eq!(bot.unwrap().username, "parser_bot");
                assert_eq!(observed.unwrap().url, "https://bot.example.com/api/bot");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            platform.calls(),
            vec!["getWebhookInfo", "deleteWebhook", "setWebhook", "getMe", "getWebhookInfo"]
        );
        let state = platform.get_webhook_state().await.unwrap();
        assert_eq!(state.url, "https://bot.example.com/api/bot");
    }

    #[tokio::test]
    async fn test_set_rejection_is_reported_not_raised() {
        let platform = FakePlatform {
            fail_set: Some(ApiError::Remote {
                code: 400,
                message: "Bad Request: bad webhook".into(),
            }),
            ..Default::default()
        };
        let want = desired("https://bot.example.com/api/bot", true);

        let outcome = Registrar::new(&platform, &want).reconcile().await;

        match outcome {
            RegistrationOutcome::Failed { phase, error } => {
                assert_eq!(phase, Phase::Setting);
                assert!(matches!(error, ApiError::Remote { code: 400, .. }));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!platform.calls().contains(&"getMe".to_string()));
    }

    #[tokio::test]
    async fn test_delete_failure_stops_before_set() {
        let platform = FakePlatform {
            fail_delete: Some(ApiError::Transport("timed out".into())),
            ..Default::default()
        };
        let want = desired("https://bot.example.com/api/bot", true);

        let outcome = Registrar::new(&platform, &want).reconcile().await;

        assert!(matches!(
            outcome,
            RegistrationOutcome::Failed { phase: Phase::Deleting, .. }
        ));
        assert!(!platform.calls().contains(&"setWebhook".to_string()));
    }

    #[tokio::test]
    async fn test_delete_when_nothing_set() {
        let platform = FakePlatform::default();
        let want = desired("https://bot.example.com/api/bot", true);

        assert!(Registrar::new(&platform, &want).delete().await.is_ok());
        assert!(Registrar::new(&platform, &want).delete().await.is_ok());
    }
}
