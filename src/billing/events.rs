//! Verified, typed processor webhook events.
//!
//! A raw body is checked against its signature header before it is decoded into a
//! [`WebhookEvent`]. Handlers downstream never see untyped payloads.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

use super::processor::{from_unix, ProcessorInvoice, ProcessorSubscription};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age (seconds) of a signed timestamp.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookError {
    #[error("missing signature header")]
    MissingSignature,
    #[error("malformed signature header")]
    MalformedSignature,
    #[error("signature timestamp outside tolerance")]
    TimestampOutOfTolerance,
    #[error("signature mismatch")]
    SignatureMismatch,
    #[error("webhook secret is not configured")]
    SecretNotConfigured,
    #[error("invalid event payload: {0}")]
    Payload(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEventKind {
    SubscriptionCreated(ProcessorSubscription),
    SubscriptionUpdated(ProcessorSubscription),
    SubscriptionDeleted(ProcessorSubscription),
    TrialWillEnd(ProcessorSubscription),
    InvoicePaid(ProcessorInvoice),
    InvoicePaymentFailed(ProcessorInvoice),
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub created: DateTime<Utc>,
    pub kind: WebhookEventKind,
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: RawEventData,
}

#[derive(Deserialize)]
struct RawEventData {
    object: Value,
}

struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<Vec<u8>>,
}

fn parse_signature_header(header: &str) -> Result<SignatureHeader, WebhookError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" => {
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }
    match timestamp {
        Some(timestamp) if !signatures.is_empty() => Ok(SignatureHeader {
            timestamp,
            signatures,
        }),
        _ => Err(WebhookError::MalformedSignature),
    }
}

/// Checks a `t=<unix>,v1=<hex>` header against HMAC-SHA256 of `"<t>.<payload>"`.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: DateTime<Utc>,
) -> Result<(), WebhookError> {
    if secret.is_empty() {
        return Err(WebhookError::SecretNotConfigured);
    }
    let parsed = parse_signature_header(header)?;
    if (now.timestamp() - parsed.timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(WebhookError::TimestampOutOfTolerance);
    }

    let mut base = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| WebhookError::SecretNotConfigured)?;
    base.update(parsed.timestamp.to_string().as_bytes());
    base.update(b".");
    base.update(payload);

    let matched = parsed
        .signatures
        .iter()
        .any(|candidate| base.clone().verify_slice(candidate).is_ok());
    if matched {
        Ok(())
    } else {
        Err(WebhookError::SignatureMismatch)
    }
}

/// Decodes an already verified `payload` into a typed event. Call [`verify_signature`] first.
pub fn decode_event(payload: &[u8]) -> Result<WebhookEvent, WebhookError> {
    let raw: RawEvent =
        serde_json::from_slice(payload).map_err(|err| WebhookError::Payload(err.to_string()))?;
    let created = from_unix(raw.created).ok_or_else(|| {
        WebhookError::Payload(format!("invalid created timestamp {}", raw.created))
    })?;
    let object = raw.data.object;

    let kind = match raw.event_type.as_str() {
        "customer.subscription.created" => {
            WebhookEventKind::SubscriptionCreated(decode_object(object)?)
        }
        "customer.subscription.updated" => {
            WebhookEventKind::SubscriptionUpdated(decode_object(object)?)
        }
        "customer.subscription.deleted" => {
            WebhookEventKind::SubscriptionDeleted(decode_object(object)?)
        }
        "customer.subscription.trial_will_end" => {
            WebhookEventKind::TrialWillEnd(decode_object(object)?)
        }
        "invoice.paid" | "invoice.payment_succeeded" => {
            WebhookEventKind::InvoicePaid(decode_object(object)?)
        }
        "invoice.payment_failed" => WebhookEventKind::InvoicePaymentFailed(decode_object(object)?),
        _ => WebhookEventKind::Other,
    };

    Ok(WebhookEvent {
        id: raw.id,
        event_type: raw.event_type,
        created,
        kind,
    })
}

fn decode_object<T: serde::de::DeserializeOwned>(object: Value) -> Result<T, WebhookError> {
    serde_json::from_value(object).map_err(|err| WebhookError::Payload(err.to_string()))
}

/// Produces a header value accepted by [`verify_signature`].
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return format!("t={timestamp}"),
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}
