use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use super::catalog::PlanKey;
use crate::config::{STRIPE_API_BASE, STRIPE_SECRET_KEY};

/// Metadata key carrying the local organization id on processor objects.
pub const ORGANIZATION_METADATA_KEY: &str = "organization_id";
/// Metadata key carrying the plan key on processor subscriptions.
pub const PLAN_METADATA_KEY: &str = "plan_id";

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("processor returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ProcessorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProcessorError::Api { status: 404, .. })
    }
}

pub fn from_unix(seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0).single()
}

/// Reads an explicit `null` as the field's default.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorCustomer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRef {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub id: String,
    pub price: PriceRef,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

/// key: billing-processor -> live subscription object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorSubscription {
    pub id: String,
    pub customer: String,
    pub status: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub items: SubscriptionItems,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub canceled_at: Option<i64>,
}

impl ProcessorSubscription {
    pub fn primary_item(&self) -> Option<&SubscriptionItem> {
        self.items.data.first()
    }

    pub fn price_id(&self) -> Option<&str> {
        self.primary_item().map(|item| item.price.id.as_str())
    }

    pub fn organization_id(&self) -> Option<i32> {
        parse_organization_id(&self.metadata)
    }

    pub fn plan_metadata(&self) -> Option<&str> {
        self.metadata.get(PLAN_METADATA_KEY).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransitions {
    #[serde(default)]
    pub paid_at: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionDetails {
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorInvoice {
    /// Absent on upcoming invoices, which have not been finalized yet.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub currency: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub hosted_invoice_url: Option<String>,
    #[serde(default)]
    pub invoice_pdf: Option<String>,
    #[serde(default)]
    pub period_start: Option<i64>,
    #[serde(default)]
    pub period_end: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status_transitions: StatusTransitions,
    #[serde(default)]
    pub next_payment_attempt: Option<i64>,
    #[serde(default)]
    pub attempt_count: Option<i64>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub subscription_details: Option<SubscriptionDetails>,
}

impl ProcessorInvoice {
    /// Organization id from the invoice metadata, else from the owning subscription's metadata.
    pub fn organization_id(&self) -> Option<i32> {
        parse_organization_id(&self.metadata).or_else(|| {
            self.subscription_details
                .as_ref()
                .and_then(|details| parse_organization_id(&details.metadata))
        })
    }

    pub fn plan_metadata(&self) -> Option<&str> {
        self.metadata
            .get(PLAN_METADATA_KEY)
            .or_else(|| {
                self.subscription_details
                    .as_ref()
                    .and_then(|details| details.metadata.get(PLAN_METADATA_KEY))
            })
            .map(String::as_str)
    }
}

fn parse_organization_id(metadata: &HashMap<String, String>) -> Option<i32> {
    metadata
        .get(ORGANIZATION_METADATA_KEY)
        .and_then(|value| value.trim().parse().ok())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardDetails {
    #[serde(default)]
    pub brand: String,
    pub last4: String,
    #[serde(default)]
    pub exp_month: Option<u32>,
    #[serde(default)]
    pub exp_year: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: String,
    #[serde(default)]
    pub card: Option<CardDetails>,
}

impl PaymentMethod {
    /// Display form such as `visa ending in 4242`. Never exposes more than the last four digits.
    pub fn masked(&self) -> Option<String> {
        self.card
            .as_ref()
            .map(|card| format!("{} ending in {}", card.brand, card.last4))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalSession {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSubscription {
    pub subscription: ProcessorSubscription,
    /// Present when the first payment needs confirmation by the customer.
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCustomer<'a> {
    pub organization_id: i32,
    pub name: &'a str,
    pub email: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubscription<'a> {
    pub organization_id: i32,
    pub customer_id: &'a str,
    pub price_id: &'a str,
    pub plan: PlanKey,
    pub trial_days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest<'a> {
    pub organization_id: i32,
    pub customer_id: &'a str,
    pub price_id: &'a str,
    pub plan: PlanKey,
    pub trial_days: u32,
    pub success_url: &'a str,
    pub cancel_url: &'a str,
}

/// key: billing-processor -> external payment processor surface
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_customer(
        &self,
        customer: &NewCustomer<'_>,
    ) -> Result<ProcessorCustomer, ProcessorError>;

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<ProcessorSubscription, ProcessorError>;

    async fn create_subscription(
        &self,
        request: &NewSubscription<'_>,
    ) -> Result<CreatedSubscription, ProcessorError>;

    /// Swaps the price on `item_id` and tags the subscription with `plan`.
    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        item_id: &str,
        price_id: &str,
        plan: PlanKey,
    ) -> Result<ProcessorSubscription, ProcessorError>;

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> Result<ProcessorSubscription, ProcessorError>;

    async fn list_payment_methods(
        &self,
        customer_id: &str,
    ) -> Result<Vec<PaymentMethod>, ProcessorError>;

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
    ) -> Result<PaymentMethod, ProcessorError>;

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> Result<(), ProcessorError>;

    /// The next invoice the processor will issue; `None` when nothing is scheduled.
    async fn upcoming_invoice(
        &self,
        customer_id: &str,
    ) -> Result<Option<ProcessorInvoice>, ProcessorError>;

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest<'_>,
    ) -> Result<CheckoutSession, ProcessorError>;

    async fn create_billing_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<PortalSession, ProcessorError>;
}

#[derive(Deserialize)]
struct ListResponse<T> {
    data: Vec<T>,
}

/// Stripe REST client: form-encoded requests, bearer auth.
pub struct StripeClient {
    base: String,
    secret_key: String,
    client: Client,
}

impl StripeClient {
    pub fn from_config() -> Self {
        Self::new(STRIPE_API_BASE.as_str(), STRIPE_SECRET_KEY.as_str())
    }

    pub fn new(base: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
            client: Client::new(),
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ProcessorError> {
        let url = format!("{}/v1/{}", self.base, path);
        let mut req = self
            .client
            .request(method.clone(), &url)
            .bearer_auth(&self.secret_key);
        if !params.is_empty() {
            req = if method == Method::GET {
                req.query(params)
            } else {
                req.form(params)
            };
        }

        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        if !status.is_success() {
            return Err(api_error(status, &body));
        }
        serde_json::from_slice(&body).map_err(|err| ProcessorError::Decode(err.to_string()))
    }
}

fn api_error(status: StatusCode, body: &[u8]) -> ProcessorError {
    let message = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|value| value["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
    ProcessorError::Api {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    async fn create_customer(
        &self,
        customer: &NewCustomer<'_>,
    ) -> Result<ProcessorCustomer, ProcessorError> {
        let mut params = vec![
            ("name", customer.name.to_string()),
            (
                "metadata[organization_id]",
                customer.organization_id.to_string(),
            ),
        ];
        if let Some(email) = customer.email {
            params.push(("email", email.to_string()));
        }
        self.request(Method::POST, "customers", &params).await
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<ProcessorSubscription, ProcessorError> {
        self.request(Method::GET, &format!("subscriptions/{subscription_id}"), &[])
            .await
    }

    async fn create_subscription(
        &self,
        request: &NewSubscription<'_>,
    ) -> Result<CreatedSubscription, ProcessorError> {
        let params = [
            ("customer", request.customer_id.to_string()),
            ("items[0][price]", request.price_id.to_string()),
            ("trial_period_days", request.trial_days.to_string()),
            ("payment_behavior", "default_incomplete".to_string()),
            ("expand[]", "latest_invoice.payment_intent".to_string()),
            (
                "metadata[organization_id]",
                request.organization_id.to_string(),
            ),
            ("metadata[plan_id]", request.plan.as_str().to_string()),
        ];
        let raw: Value = self.request(Method::POST, "subscriptions", &params).await?;
        let client_secret = raw["latest_invoice"]["payment_intent"]["client_secret"]
            .as_str()
            .map(str::to_string);
        let subscription = serde_json::from_value(raw)
            .map_err(|err| ProcessorError::Decode(err.to_string()))?;
        Ok(CreatedSubscription {
            subscription,
            client_secret,
        })
    }

    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        item_id: &str,
        price_id: &str,
        plan: PlanKey,
    ) -> Result<ProcessorSubscription, ProcessorError> {
        let params = [
            ("items[0][id]", item_id.to_string()),
            ("items[0][price]", price_id.to_string()),
            ("proration_behavior", "create_prorations".to_string()),
            ("metadata[plan_id]", plan.as_str().to_string()),
        ];
        self.request(
            Method::POST,
            &format!("subscriptions/{subscription_id}"),
            &params,
        )
        .await
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> Result<ProcessorSubscription, ProcessorError> {
        self.request(
            Method::POST,
            &format!("subscriptions/{subscription_id}"),
            &[("cancel_at_period_end", cancel.to_string())],
        )
        .await
    }

    async fn list_payment_methods(
        &self,
        customer_id: &str,
    ) -> Result<Vec<PaymentMethod>, ProcessorError> {
        let list: ListResponse<PaymentMethod> = self
            .request(
                Method::GET,
                "payment_methods",
                &[
                    ("customer", customer_id.to_string()),
                    ("type", "card".to_string()),
                ],
            )
            .await?;
        Ok(list.data)
    }

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
    ) -> Result<PaymentMethod, ProcessorError> {
        self.request(
            Method::POST,
            &format!("payment_methods/{payment_method_id}/attach"),
            &[("customer", customer_id.to_string())],
        )
        .await
    }

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> Result<(), ProcessorError> {
        let _: Value = self
            .request(
                Method::POST,
                &format!("customers/{customer_id}"),
                &[(
                    "invoice_settings[default_payment_method]",
                    payment_method_id.to_string(),
                )],
            )
            .await?;
        Ok(())
    }

    async fn upcoming_invoice(
        &self,
        customer_id: &str,
    ) -> Result<Option<ProcessorInvoice>, ProcessorError> {
        match self
            .request(
                Method::GET,
                "invoices/upcoming",
                &[("customer", customer_id.to_string())],
            )
            .await
        {
            Ok(invoice) => Ok(Some(invoice)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest<'_>,
    ) -> Result<CheckoutSession, ProcessorError> {
        let organization_id = request.organization_id.to_string();
        let params = [
            ("mode", "subscription".to_string()),
            ("customer", request.customer_id.to_string()),
            ("line_items[0][price]", request.price_id.to_string()),
            ("line_items[0][quantity]", "1".to_string()),
            ("success_url", request.success_url.to_string()),
            ("cancel_url", request.cancel_url.to_string()),
            (
                "subscription_data[trial_period_days]",
                request.trial_days.to_string(),
            ),
            (
                "subscription_data[metadata][organization_id]",
                organization_id.clone(),
            ),
            (
                "subscription_data[metadata][plan_id]",
                request.plan.as_str().to_string(),
            ),
            ("metadata[organization_id]", organization_id),
        ];
        self.request(Method::POST, "checkout/sessions", &params)
            .await
    }

    async fn create_billing_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<PortalSession, ProcessorError> {
        self.request(
            Method::POST,
            "billing_portal/sessions",
            &[
                ("customer", customer_id.to_string()),
                ("return_url", return_url.to_string()),
            ],
        )
        .await
    }
}
