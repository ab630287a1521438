use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use std::env;

use sqlx::PgPool;
use tokio::net::TcpListener;
use tracing::{info, warn};

use fulfillment_service::app::{build_router, AppState};
use fulfillment_service::cache::{CacheStore, MemoryCache, RedisCache};
use fulfillment_service::metrics::PipelineMetrics;
use fulfillment_service::notify::SmtpNotifier;
use fulfillment_service::providers::paypal::{PayPalClient, DEFAULT_API_BASE};
use fulfillment_service::providers::stripe::StripeClient;
use fulfillment_service::realtime::Broadcaster;
use fulfillment_service::schema::ensure_schema;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let db = PgPool::connect(&database_url).await?;
    ensure_schema(&db).await?;

    let cache: Arc<dyn CacheStore> = match env::var("REDIS_URL") {
        Ok(url) => match RedisCache::connect(&url).await {
            Ok(cache) => {
                info!(redis_url = %url, "redis cache connected");
                Arc::new(cache)
            }
            Err(err) => {
                warn!(error = %err, "redis unavailable; using in-process cache");
                Arc::new(MemoryCache::new())
            }
        },
        Err(_) => Arc::new(MemoryCache::new()),
    };

    let notifier = Arc::new(SmtpNotifier::new(
        env::var("SMTP_HOST").unwrap_or_else(|_| "smtp.gmail.com".into()),
        env::var("SMTP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(587),
        env::var("SMTP_USER").unwrap_or_default(),
        env::var("SMTP_PASSWORD").unwrap_or_default(),
        env::var("MAIL_FROM").unwrap_or_else(|_| "Box Office <no-reply@example.com>".into()),
    ));

    let http = reqwest::Client::new();
    let stripe = StripeClient::new(
        http.clone(),
        env::var("STRIPE_SECRET_KEY").unwrap_or_default(),
        env::var("STRIPE_API_URL").unwrap_or_else(|_| "https://api.stripe.com".into()),
    );
    let paypal = PayPalClient::new(
        http,
        env::var("PAYPAL_CLIENT_ID").unwrap_or_default(),
        env::var("PAYPAL_CLIENT_SECRET").unwrap_or_default(),
        env::var("PAYPAL_API_URL").unwrap_or_else(|_| DEFAULT_API_BASE.into()),
        env::var("PAYPAL_WEBHOOK_ID").unwrap_or_default(),
    );

    let state = AppState {
        db,
        cache,
        notifier,
        broadcaster: Broadcaster::new(256),
        stripe,
        paypal,
        metrics: Arc::new(PipelineMetrics::new()),
        stripe_webhook_secret: env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default(),
        webhook_max_skew_secs: env::var("WEBHOOK_MAX_SKEW_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300),
        cache_ttl: Duration::from_secs(
            env::var("CACHE_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        ),
    };

    let app = build_router(state);

    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8090);
    let ip: std::net::IpAddr = host.parse()?;
    let addr = SocketAddr::from((ip, port));
    println!("starting fulfillment-service on {addr}");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
