use axum::{
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::enforcement::{EntitlementCheck, EntitlementDecision};
use super::events::WebhookError;
use super::models::UsageRecord;
use super::service::{ActionResponse, BillingAction, BillingService, BillingSnapshot, UsageRequest};
use super::webhook::WebhookProcessor;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// key: billing-api -> dashboard snapshot
pub async fn get_billing(
    Extension(service): Extension<BillingService>,
    user: AuthUser,
) -> AppResult<Json<BillingSnapshot>> {
    let organization = service
        .organization_for(&user.organization_external_id)
        .await?;
    let snapshot = service.snapshot(&organization, Utc::now()).await?;
    Ok(Json(snapshot))
}

pub async fn post_billing_action(
    Extension(service): Extension<BillingService>,
    user: AuthUser,
    Json(body): Json<Value>,
) -> AppResult<Json<ActionResponse>> {
    let action = BillingAction::from_value(body)?;
    let organization = service
        .organization_for(&user.organization_external_id)
        .await?;
    info!(
        user_id = user.user_id,
        role = %user.role,
        action = action.name(),
        "billing action requested"
    );
    let response = service.execute(&organization, action).await?;
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
pub struct UsageRecorded {
    pub success: bool,
    pub record: UsageRecord,
}

pub async fn record_usage(
    Extension(service): Extension<BillingService>,
    user: AuthUser,
    Json(request): Json<UsageRequest>,
) -> AppResult<(StatusCode, Json<UsageRecorded>)> {
    let organization = service
        .organization_for(&user.organization_external_id)
        .await?;
    let record = service
        .record_usage(&organization, request, Utc::now())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(UsageRecorded {
            success: true,
            record,
        }),
    ))
}

pub async fn check_entitlement(
    Extension(service): Extension<BillingService>,
    user: AuthUser,
    Json(check): Json<EntitlementCheck>,
) -> AppResult<Json<EntitlementDecision>> {
    let organization = service
        .organization_for(&user.organization_external_id)
        .await?;
    let decision = service
        .check_entitlement(&organization, check, Utc::now())
        .await?;
    Ok(Json(decision))
}

/// key: billing-webhooks -> signed processor callbacks
///
/// Signature failures are rejected with 400 before anything is parsed. Once verified, the
/// event is acknowledged, even when its payload cannot be decoded, unless its state change
/// could not be stored. That 5xx makes the processor redeliver it.
pub async fn stripe_webhook(
    Extension(processor): Extension<WebhookProcessor>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::BadRequest(WebhookError::MissingSignature.to_string()))?;

    processor
        .verify(&body, signature, Utc::now())
        .map_err(|err| {
            warn!(%err, "rejected webhook delivery");
            AppError::BadRequest(err.to_string())
        })?;

    let event = match processor.decode(&body) {
        Ok(event) => event,
        Err(err) => {
            warn!(%err, "acknowledging undecodable webhook payload");
            return Ok(Json(json!({ "received": true })));
        }
    };

    match processor.handle(&event).await {
        Ok(_) => Ok(Json(json!({ "received": true }))),
        Err(err) => {
            error!(
                ?err,
                event_id = %event.id,
                event_type = %event.event_type,
                "failed to apply webhook event"
            );
            Err(err.into())
        }
    }
}
