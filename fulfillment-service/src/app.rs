use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{
    header::{ACCEPT, CONTENT_TYPE},
    HeaderName, HeaderValue, Method, StatusCode,
};
use axum::{middleware, routing::{get, post}, Router};
use prometheus::{Encoder, TextEncoder};
use sqlx::PgPool;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::cache::CacheStore;
use crate::catalog_handlers::get_catalog_entity;
use crate::metrics::PipelineMetrics;
use crate::notify::Notifier;
use crate::payment_handlers::{paypal_capture, verify_session};
use crate::providers::paypal::PayPalClient;
use crate::providers::stripe::StripeClient;
use crate::realtime::{ws_handler, Broadcaster};
use crate::ticket_handlers::{issue_guest_ticket, redeem};
use crate::webhook_handlers::{paypal_webhook, stripe_webhook};

/// Shared application state. Every collaborator is constructed in main and
/// injected here; nothing lives as module-level global state.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub cache: Arc<dyn CacheStore>,
    pub notifier: Arc<dyn Notifier>,
    pub broadcaster: Broadcaster,
    pub stripe: StripeClient,
    pub paypal: PayPalClient,
    pub metrics: Arc<PipelineMetrics>,
    pub stripe_webhook_secret: String,
    pub webhook_max_skew_secs: i64,
    pub cache_ttl: Duration,
}

pub async fn health() -> &'static str {
    "ok"
}

async fn metrics_endpoint(State(state): State<AppState>) -> (StatusCode, String) {
    let encoder = TextEncoder::new();
    let families = state.metrics.registry.gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encode error: {e}"),
        );
    }
    (StatusCode::OK, String::from_utf8_lossy(&buf).to_string())
}

async fn error_metrics_mw(
    State(metrics): State<Arc<PipelineMetrics>>,
    req: axum::http::Request<Body>,
    next: middleware::Next,
) -> axum::response::Response {
    let resp = next.run(req).await;
    let status = resp.status();
    if status.as_u16() >= 400 {
        let code = resp
            .headers()
            .get("X-Error-Code")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown");
        metrics
            .http_errors_total
            .with_label_values(&["fulfillment-service", code, status.as_str()])
            .inc();
    }
    resp
}

pub fn build_router(state: AppState) -> Router {
    let allowed_origins = [
        "http://localhost:3000",
        "http://localhost:3001",
        "http://localhost:5173",
    ];

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            allowed_origins
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok())
                .collect::<Vec<_>>(),
        ))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([ACCEPT, CONTENT_TYPE, HeaderName::from_static("authorization")]);

    let metrics = state.metrics.clone();

    Router::new()
        .route("/healthz", get(health))
        .route("/webhooks/stripe", post(stripe_webhook))
        .route("/webhooks/paypal", post(paypal_webhook))
        .route("/payments/verify-session", post(verify_session))
        .route("/payments/paypal/capture", post(paypal_capture))
        .route("/redemptions", post(redeem))
        .route("/guestlist/issue", post(issue_guest_ticket))
        .route("/catalog/:entity_id", get(get_catalog_entity))
        .route("/ws", get(ws_handler))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
        .layer(middleware::from_fn_with_state(metrics, error_metrics_mw))
        .layer(cors)
}
