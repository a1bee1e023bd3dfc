//! Read-only checks against the real Bot API.
//!
//! These tests require a real bot token in `BOT_TOKEN`. They never change the
//! webhook.
//!
//! Run with: BOT_TOKEN=... cargo test --features integ_test --test live_api

#[cfg(feature = "integ_test")]
mod tests {
    use std::time::Duration;

    use hookline::webhook::{ApiError, BotApi, TelegramApi};
    use reqwest::Url;

    fn api() -> Option<TelegramApi> {
        let Ok(token) = std::env::var("BOT_TOKEN") else {
            eprintln!("Skipping test: BOT_TOKEN not set");
            return None;
        };
        let base = Url::parse("https://api.telegram.org").unwrap();
        Some(TelegramApi::new(token, base, Duration::from_secs(10)).unwrap())
    }

    #[tokio::test]
    async fn test_get_identity() {
        let Some(api) = api() else { return };
        let me = api.get_identity().await.expect("getMe should succeed");
        assert!(!me.username.is_empty());
        eprintln!("Bot: @{} ({})", me.username, me.id);
    }

    #[tokio::test]
    async fn test_get_webhook_state() {
        let Some(api) = api() else { return };
        let state = api.get_webhook_state().await.expect("getWebhookInfo should succeed");
        eprintln!("Webhook: '{}' ({} pending)", state.url, state.pending_update_count);
    }

    #[tokio::test]
    async fn test_invalid_token_rejected() {
        let base = Url::parse("https://api.telegram.org").unwrap();
        let api = TelegramApi::new("1:invalid", base, Duration::from_secs(10)).unwrap();
        match api.get_identity().await {
            Err(ApiError::Remote { code, .. }) => assert_eq!(code, 401),
            Err(ApiError::Transport(e)) => eprintln!("Skipping test: no network ({e})"),
            Ok(me) => panic!("invalid token accepted as @{}", me.username),
        }
    }
}
