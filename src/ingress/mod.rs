//! HTTP ingress for platform webhook deliveries.

pub mod update;

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use reqwest::Url;
use subtle::ConstantTimeEq;
use teloxide::prelude::*;
use tokio::net::TcpListener;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

pub use update::{AppError, Application, InboundUpdate, LoggingApplication};

/// Path the platform posts updates to, appended to the public base URL.
pub const INGRESS_PATH: &str = "/api/bot";

/// Header the platform uses to echo the `secret_token` given to setWebhook.
pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Body of every ingress response: `{"status": "..."}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressStatus {
    Ok,
    InvalidJson,
    InvalidRequest,
    Unauthorized,
    TokenNotConfigured,
}

impl IngressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngressStatus::Ok => "ok",
            IngressStatus::InvalidJson => "invalid json",
            IngressStatus::InvalidRequest => "invalid request",
            IngressStatus::Unauthorized => "unauthorized",
            IngressStatus::TokenNotConfigured => "bot token not configured",
        }
    }

    pub fn code(&self) -> StatusCode {
        match self {
            IngressStatus::Ok => StatusCode::OK,
            IngressStatus::InvalidJson | IngressStatus::InvalidRequest => StatusCode::BAD_REQUEST,
            IngressStatus::Unauthorized => StatusCode::UNAUTHORIZED,
            IngressStatus::TokenNotConfigured => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for IngressStatus {
    fn into_response(self) -> Response {
        (self.code(), Json(serde_json::json!({ "status": self.as_str() }))).into_response()
    }
}

/// Request fields the handler looks at, independent of the HTTP framework.
pub struct InboundRequest<'a> {
    pub method: Method,
    pub content_type: Option<&'a str>,
    pub secret_token: Option<&'a str>,
    pub body: Bytes,
}

/// Validates deliveries and hands them to the application.
///
/// Shared by every request task; the only mutable state is the one-time
/// initialization cell.
pub struct IngressHandler<A: Application> {
    app: Arc<A>,
    bot: Option<Bot>,
    secret: Option<String>,
    initialized: OnceCell<()>,
}

impl<A: Application> IngressHandler<A> {
    /// `token: None` means misconfiguration; every delivery gets a 500.
    pub fn new(app: A, token: Option<&str>, api_base: Option<Url>, secret: Option<String>) -> Self {
        let bot = token.map(|t| {
            let bot = Bot::new(t);
            match api_base {
                Some(url) => bot.set_api_url(url),
                None => bot,
            }
        });
        Self {
            app: Arc::new(app),
            bot,
            secret,
            initialized: OnceCell::new(),
        }
    }

    pub fn application(&self) -> &A {
        &self.app
    }

    pub async fn handle(&self, request: InboundRequest<'_>) -> IngressStatus {
        let Some(ref bot) = self.bot else {
            error!("Webhook delivery rejected: bot token not configured");
            return IngressStatus::TokenNotConfigured;
        };

        if request.method != Method::POST {
            debug!("Webhook delivery rejected: method {}", request.method);
            return IngressStatus::InvalidRequest;
        }

        if let Some(ref expected) = self.secret
            && !secret_matches(expected, request.secret_token)
        {
            warn!("Webhook delivery rejected: secret token mismatch");
            return IngressStatus::Unauthorized;
        }

        if let Some(ct) = request.content_type
            && !ct.starts_with("application/json")
        {
            debug!("Webhook delivery with content type {ct}, parsing as JSON anyway");
        }

        let envelope: serde_json::Value = match serde_json::from_slice(&request.body) {
            Ok(v) => v,
            Err(e) => {
                warn!("Received invalid JSON in webhook: {e}");
                return IngressStatus::InvalidJson;
            }
        };

        let update = InboundUpdate {
            raw: request.body,
            envelope,
            bot: bot.clone(),
        };
        self.dispatch(update).await;
        IngressStatus::Ok
    }

    /// Runs initialization once, then the application, in its own task so a
    /// panic there stays there.
    async fn dispatch(&self, update: InboundUpdate) {
        let update_id = update.update_id();

        let init = self
            .initialized
            .get_or_try_init(|| async { self.app.initialize().await })
            .await;
        if let Err(e) = init {
            error!("Dropping update {:?}: application failed to initialize: {e}", update_id);
            return;
        }

        let app = self.app.clone();
        let task = tokio::spawn(async move { app.process_update(update).await });
        match task.await {
            Ok(Ok(())) => debug!("Update {:?} processed", update_id),
            Ok(Err(e)) => warn!("Update {:?} failed in application: {e}", update_id),
            Err(e) => error!("Update {:?} handler panicked: {e}", update_id),
        }
    }
}

/// Constant-time on content; only the length can leak.
fn secret_matches(expected: &str, presented: Option<&str>) -> bool {
    match presented {
        Some(presented) => expected.as_bytes().ct_eq(presented.as_bytes()).unwrap_u8() == 1,
        None => false,
    }
}

async fn receive<A: Application>(
    State(handler): State<Arc<IngressHandler<A>>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> IngressStatus {
    let content_type = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let secret_token = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
    handler
        .handle(InboundRequest {
            method,
            content_type,
            secret_token,
            body,
        })
        .await
}

async fn health() -> &'static str {
    "OK"
}

pub fn router<A: Application>(handler: Arc<IngressHandler<A>>) -> Router {
    Router::new()
        .route(INGRESS_PATH, any(receive::<A>))
        .route("/health", get(health))
        .with_state(handler)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Listening for webhook deliveries on {addr}{INGRESS_PATH}");
    }
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await
}
