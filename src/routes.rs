use axum::{
    routing::{get, post},
    Extension, Router,
};

use crate::billing::{self, BillingService, WebhookProcessor};

pub fn api_routes() -> Router {
    Router::new()
        .route(
            "/api/billing",
            get(billing::get_billing).post(billing::post_billing_action),
        )
        .route("/api/billing/usage", post(billing::record_usage))
        .route(
            "/api/billing/entitlements",
            post(billing::check_entitlement),
        )
        .route("/api/webhooks/stripe", post(billing::stripe_webhook))
}

pub async fn root() -> &'static str {
    "Switchboard Billing API"
}

/// API routes with the billing services attached, without metrics.
pub fn app(service: BillingService, webhooks: WebhookProcessor) -> Router {
    Router::new()
        .route("/", get(root))
        .merge(api_routes())
        .layer(Extension(service))
        .layer(Extension(webhooks))
}
