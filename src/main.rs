use axum::{routing::get, Router};
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use switchboard_billing::billing::{
    start_notification_worker, BillingService, BillingSettings, BillingStore, HttpNotifier,
    LogNotifier, Notifier, PaymentProcessor, PgBillingStore, StripeClient, WebhookProcessor,
    WebhookSettings,
};
use switchboard_billing::{app, config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast if the JWT secret is missing
    let _ = config::JWT_SECRET.as_str();
    if config::STRIPE_WEBHOOK_SECRET.is_empty() {
        tracing::warn!("STRIPE_WEBHOOK_SECRET is not set; webhook deliveries will be rejected");
    }

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config::DATABASE_URL.as_str())
        .await?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(error.into());
        }
    }

    let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool.clone()));
    let processor: Arc<dyn PaymentProcessor> = Arc::new(StripeClient::from_config());
    let notifier: Arc<dyn Notifier> = match config::NOTIFICATION_RELAY_URL.as_deref() {
        Some(url) => Arc::new(HttpNotifier::new(url)),
        None => Arc::new(LogNotifier),
    };
    let notifications = start_notification_worker(notifier);

    let service = BillingService::new(
        store.clone(),
        processor.clone(),
        BillingSettings::from_config(),
    );
    let webhooks = WebhookProcessor::new(
        store,
        processor,
        notifications,
        WebhookSettings::from_config(),
    );

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let router = Router::new()
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(app(service, webhooks))
        .layer(prometheus_layer);

    let addr: SocketAddr =
        format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT).parse()?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(router.into_make_service())
        .await?;

    Ok(())
}
