use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use super::catalog::{PlanKey, TierDefinition};
use super::enforcement::{
    can_access_api, can_add_phone_number, can_send_sms, can_use_ai_feature,
    check_extension_limit, EntitlementCheck, EntitlementDecision,
};
use super::error::{bounded, BillingError, BillingTimeouts};
use super::models::{
    BillingPeriod, Invoice, Organization, PhoneNumberInventory, Subscription,
    SubscriptionStatus, UsageRecord, UsageSummary, UsageType, MAX_USAGE_QUANTITY,
    MAX_USAGE_UNIT_PRICE,
};
use super::overage::ChargeBreakdown;
use super::processor::{
    CheckoutRequest, NewCustomer, NewSubscription, PaymentMethod, PaymentProcessor,
    ProcessorInvoice, ProcessorSubscription,
};
use super::store::BillingStore;
use super::usage;
use crate::config::{PlanPriceIds, BILLING_TRIAL_DAYS, STRIPE_PRICE_IDS};

const RECENT_INVOICE_LIMIT: i64 = 10;

#[derive(Debug, Clone)]
pub struct BillingSettings {
    pub prices: PlanPriceIds,
    pub timeouts: BillingTimeouts,
    pub trial_days: u32,
}

impl BillingSettings {
    pub fn from_config() -> Self {
        Self {
            prices: STRIPE_PRICE_IDS.clone(),
            timeouts: BillingTimeouts::from_config(),
            trial_days: *BILLING_TRIAL_DAYS,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationView {
    pub id: i32,
    pub name: String,
    pub plan: String,
    pub billing_status: Option<SubscriptionStatus>,
    pub stripe_customer_id: Option<String>,
    pub billing_email: Option<String>,
}

impl From<&Organization> for OrganizationView {
    fn from(organization: &Organization) -> Self {
        Self {
            id: organization.id,
            name: organization.name.clone(),
            plan: organization.plan.clone(),
            billing_status: organization.billing_status,
            stripe_customer_id: organization.stripe_customer_id.clone(),
            billing_email: organization.billing_email.clone(),
        }
    }
}

/// Where the subscription section of a snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionSource {
    Subscription,
    Organization,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub source: SubscriptionSource,
    pub plan_id: String,
    pub status: Option<SubscriptionStatus>,
    pub stripe_subscription_id: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
}

impl SubscriptionView {
    fn from_row(row: &Subscription) -> Self {
        Self {
            source: SubscriptionSource::Subscription,
            plan_id: row.plan_id.clone(),
            status: Some(row.status),
            stripe_subscription_id: Some(row.stripe_subscription_id.clone()),
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            trial_ends_at: row.trial_ends_at,
            canceled_at: row.canceled_at,
        }
    }

    fn from_organization(organization: &Organization) -> Self {
        Self {
            source: SubscriptionSource::Organization,
            plan_id: organization.plan.clone(),
            status: organization.billing_status,
            stripe_subscription_id: None,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            trial_ends_at: None,
            canceled_at: None,
        }
    }
}

/// key: billing-snapshot -> dashboard read model
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingSnapshot {
    pub organization: OrganizationView,
    pub plan: &'static TierDefinition,
    pub subscription: SubscriptionView,
    pub live_subscription: Option<ProcessorSubscription>,
    pub payment_methods: Vec<PaymentMethod>,
    pub upcoming_invoice: Option<ProcessorInvoice>,
    pub invoices: Vec<Invoice>,
    pub phone_numbers: PhoneNumberInventory,
    pub usage: UsageSummary,
    pub charges: ChargeBreakdown,
    /// Sections omitted because the processor failed or timed out.
    pub degraded: Vec<&'static str>,
}

/// Tenant-initiated billing mutation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum BillingAction {
    CreateCustomer,
    #[serde(rename_all = "camelCase")]
    UpdatePaymentMethod { payment_method_id: String },
    #[serde(rename_all = "camelCase")]
    CreateSubscription { plan_id: String },
    #[serde(rename_all = "camelCase")]
    ChangePlan { plan_id: String },
    CancelSubscription,
    ReactivateSubscription,
    #[serde(rename_all = "camelCase")]
    CreateCheckoutSession {
        plan_id: String,
        success_url: String,
        cancel_url: String,
    },
    #[serde(rename_all = "camelCase")]
    CreateBillingPortal { return_url: String },
}

impl BillingAction {
    /// Parses a `{action, ...fields}` body, naming what is missing on failure.
    pub fn from_value(value: Value) -> Result<Self, BillingError> {
        let name = match value.get("action") {
            Some(Value::String(name)) if !name.trim().is_empty() => name.clone(),
            _ => return Err(BillingError::validation("action is required")),
        };
        serde_json::from_value(value).map_err(|err| {
            let message = err.to_string();
            if message.starts_with("unknown variant") {
                BillingError::validation(format!("invalid action `{name}`"))
            } else {
                BillingError::validation(format!("invalid {name} request: {message}"))
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            BillingAction::CreateCustomer => "createCustomer",
            BillingAction::UpdatePaymentMethod { .. } => "updatePaymentMethod",
            BillingAction::CreateSubscription { .. } => "createSubscription",
            BillingAction::ChangePlan { .. } => "changePlan",
            BillingAction::CancelSubscription => "cancelSubscription",
            BillingAction::ReactivateSubscription => "reactivateSubscription",
            BillingAction::CreateCheckoutSession { .. } => "createCheckoutSession",
            BillingAction::CreateBillingPortal { .. } => "createBillingPortal",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ActionResponse {
    fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRequest {
    #[serde(rename = "type")]
    pub usage_type: UsageType,
    pub quantity: i64,
    #[serde(default)]
    pub unit_price: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
}

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str, BillingError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(BillingError::validation(format!("{field} is required")))
    } else {
        Ok(trimmed)
    }
}

/// key: billing-service -> snapshot assembly and tenant actions
#[derive(Clone)]
pub struct BillingService {
    store: Arc<dyn BillingStore>,
    processor: Arc<dyn PaymentProcessor>,
    settings: BillingSettings,
}

impl BillingService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        processor: Arc<dyn PaymentProcessor>,
        settings: BillingSettings,
    ) -> Self {
        Self {
            store,
            processor,
            settings,
        }
    }

    fn timeouts(&self) -> BillingTimeouts {
        self.settings.timeouts
    }

    pub async fn organization_for(&self, external_id: &str) -> Result<Organization, BillingError> {
        bounded(
            self.timeouts().store,
            "organization lookup",
            self.store.organization_by_external_id(external_id),
        )
        .await?
        .ok_or(BillingError::NotFound("organization"))
    }

    pub async fn snapshot(
        &self,
        organization: &Organization,
        now: DateTime<Utc>,
    ) -> Result<BillingSnapshot, BillingError> {
        let store_limit = self.timeouts().store;
        let plan = organization.plan_key();
        let store = self.store.as_ref();

        let latest = bounded(
            store_limit,
            "subscription lookup",
            store.latest_subscription(organization.id),
        )
        .await?;

        let mut degraded = Vec::new();
        let mut live_subscription = None;
        let mut payment_methods = Vec::new();
        let mut upcoming_invoice = None;
        if let Some(customer_id) = organization.stripe_customer_id.as_deref() {
            let (live, methods, upcoming) = tokio::join!(
                self.live_subscription(latest.as_ref()),
                bounded(
                    self.timeouts().processor,
                    "payment method lookup",
                    self.processor.list_payment_methods(customer_id),
                ),
                bounded(
                    self.timeouts().processor,
                    "upcoming invoice lookup",
                    self.processor.upcoming_invoice(customer_id),
                ),
            );
            match live {
                Ok(subscription) => live_subscription = subscription,
                Err(err) => self.degrade(&mut degraded, "liveSubscription", organization, err),
            }
            match methods {
                Ok(methods) => payment_methods = methods,
                Err(err) => self.degrade(&mut degraded, "paymentMethods", organization, err),
            }
            match upcoming {
                Ok(invoice) => upcoming_invoice = invoice,
                Err(err) => self.degrade(&mut degraded, "upcomingInvoice", organization, err),
            }
        }

        let (invoices, phone_numbers, usage) = tokio::try_join!(
            bounded(
                store_limit,
                "invoice history",
                store.recent_invoices(organization.id, RECENT_INVOICE_LIMIT),
            ),
            bounded(
                store_limit,
                "phone number inventory",
                usage::phone_number_inventory(store, organization.id),
            ),
            bounded(
                store_limit,
                "usage summary",
                usage::usage_summary(store, plan, organization.id, now),
            ),
        )?;
        let charges = ChargeBreakdown::compute(plan, &phone_numbers, &usage);

        let subscription = match latest.as_ref() {
            Some(row) => SubscriptionView::from_row(row),
            None => SubscriptionView::from_organization(organization),
        };

        Ok(BillingSnapshot {
            organization: OrganizationView::from(organization),
            plan: plan.definition(),
            subscription,
            live_subscription,
            payment_methods,
            upcoming_invoice,
            invoices,
            phone_numbers,
            usage,
            charges,
            degraded,
        })
    }

    async fn live_subscription(
        &self,
        latest: Option<&Subscription>,
    ) -> Result<Option<ProcessorSubscription>, BillingError> {
        let Some(row) = latest else {
            return Ok(None);
        };
        bounded(
            self.timeouts().processor,
            "subscription fetch",
            self.processor.get_subscription(&row.stripe_subscription_id),
        )
        .await
        .map(Some)
    }

    fn degrade(
        &self,
        degraded: &mut Vec<&'static str>,
        section: &'static str,
        organization: &Organization,
        err: BillingError,
    ) {
        warn!(
            ?err,
            organization_id = organization.id,
            section,
            "processor section unavailable, returning partial billing snapshot"
        );
        degraded.push(section);
    }

    fn price_for(&self, plan: PlanKey) -> Result<String, BillingError> {
        self.settings
            .prices
            .price_for(plan)
            .map(str::to_string)
            .ok_or_else(|| {
                let message = format!("no processor price configured for the {plan} plan");
                BillingError::precondition(message)
            })
    }

    fn customer_id(organization: &Organization) -> Result<&str, BillingError> {
        organization.stripe_customer_id.as_deref().ok_or_else(|| {
            BillingError::precondition(
                "organization has no billing customer yet; create a customer first",
            )
        })
    }

    async fn current_subscription(
        &self,
        organization: &Organization,
    ) -> Result<Subscription, BillingError> {
        bounded(
            self.timeouts().store,
            "subscription lookup",
            self.store.latest_subscription(organization.id),
        )
        .await?
        .ok_or(BillingError::NotFound("subscription"))
    }

    /// Returns the existing processor customer or creates and persists a new one.
    async fn ensure_customer(
        &self,
        organization: &Organization,
    ) -> Result<(String, bool), BillingError> {
        if let Some(customer_id) = organization.stripe_customer_id.as_ref() {
            return Ok((customer_id.clone(), false));
        }
        let customer = bounded(
            self.timeouts().processor,
            "customer create",
            self.processor.create_customer(&NewCustomer {
                organization_id: organization.id,
                name: &organization.name,
                email: organization.billing_email.as_deref(),
            }),
        )
        .await?;
        bounded(
            self.timeouts().store,
            "customer persist",
            self.store
                .set_stripe_customer_id(organization.id, &customer.id),
        )
        .await?;
        info!(
            organization_id = organization.id,
            customer = %customer.id,
            "billing customer created"
        );
        Ok((customer.id, true))
    }

    pub async fn execute(
        &self,
        organization: &Organization,
        action: BillingAction,
    ) -> Result<ActionResponse, BillingError> {
        let processor_limit = self.timeouts().processor;
        info!(
            organization_id = organization.id,
            action = action.name(),
            "executing billing action"
        );

        match action {
            BillingAction::CreateCustomer => {
                let (customer_id, created) = self.ensure_customer(organization).await?;
                let message = if created {
                    "billing customer created"
                } else {
                    "billing customer already exists"
                };
                Ok(ActionResponse {
                    customer_id: Some(customer_id),
                    ..ActionResponse::ok()
                }
                .with_message(message))
            }
            BillingAction::UpdatePaymentMethod { payment_method_id } => {
                let payment_method_id = required("paymentMethodId", &payment_method_id)?;
                let customer_id = Self::customer_id(organization)?;
                bounded(
                    processor_limit,
                    "payment method attach",
                    self.processor
                        .attach_payment_method(payment_method_id, customer_id),
                )
                .await?;
                bounded(
                    processor_limit,
                    "default payment method update",
                    self.processor
                        .set_default_payment_method(customer_id, payment_method_id),
                )
                .await?;
                Ok(ActionResponse {
                    customer_id: Some(customer_id.to_string()),
                    ..ActionResponse::ok()
                }
                .with_message("payment method updated"))
            }
            BillingAction::CreateSubscription { plan_id } => {
                let plan: PlanKey = required("planId", &plan_id)?.parse()?;
                let customer_id = Self::customer_id(organization)?;
                let price_id = self.price_for(plan)?;
                let created = bounded(
                    processor_limit,
                    "subscription create",
                    self.processor.create_subscription(&NewSubscription {
                        organization_id: organization.id,
                        customer_id,
                        price_id: &price_id,
                        plan,
                        trial_days: self.settings.trial_days,
                    }),
                )
                .await?;
                Ok(ActionResponse {
                    customer_id: Some(customer_id.to_string()),
                    subscription_id: Some(created.subscription.id),
                    client_secret: created.client_secret,
                    ..ActionResponse::ok()
                })
            }
            BillingAction::ChangePlan { plan_id } => {
                let plan: PlanKey = required("planId", &plan_id)?.parse()?;
                let price_id = self.price_for(plan)?;
                let current = self.current_subscription(organization).await?;
                let live = bounded(
                    processor_limit,
                    "subscription fetch",
                    self.processor
                        .get_subscription(&current.stripe_subscription_id),
                )
                .await?;
                let item = live.primary_item().ok_or_else(|| {
                    BillingError::precondition("subscription has no line item to update")
                })?;
                let updated = bounded(
                    processor_limit,
                    "subscription price update",
                    self.processor
                        .update_subscription_price(&live.id, &item.id, &price_id, plan),
                )
                .await?;
                Ok(ActionResponse {
                    subscription_id: Some(updated.id),
                    ..ActionResponse::ok()
                }
                .with_message(format!("plan changed to {}", plan.definition().name)))
            }
            BillingAction::CancelSubscription => {
                self.set_cancel_at_period_end(organization, true).await
            }
            BillingAction::ReactivateSubscription => {
                self.set_cancel_at_period_end(organization, false).await
            }
            BillingAction::CreateCheckoutSession {
                plan_id,
                success_url,
                cancel_url,
            } => {
                let plan: PlanKey = required("planId", &plan_id)?.parse()?;
                let success_url = required("successUrl", &success_url)?;
                let cancel_url = required("cancelUrl", &cancel_url)?;
                let price_id = self.price_for(plan)?;
                let (customer_id, _) = self.ensure_customer(organization).await?;
                let session = bounded(
                    processor_limit,
                    "checkout session create",
                    self.processor.create_checkout_session(&CheckoutRequest {
                        organization_id: organization.id,
                        customer_id: &customer_id,
                        price_id: &price_id,
                        plan,
                        trial_days: self.settings.trial_days,
                        success_url,
                        cancel_url,
                    }),
                )
                .await?;
                Ok(ActionResponse {
                    customer_id: Some(customer_id),
                    url: session.url,
                    ..ActionResponse::ok()
                })
            }
            BillingAction::CreateBillingPortal { return_url } => {
                let return_url = required("returnUrl", &return_url)?;
                let customer_id = Self::customer_id(organization)?;
                let session = bounded(
                    processor_limit,
                    "billing portal create",
                    self.processor
                        .create_billing_portal_session(customer_id, return_url),
                )
                .await?;
                Ok(ActionResponse {
                    customer_id: Some(customer_id.to_string()),
                    url: Some(session.url),
                    ..ActionResponse::ok()
                })
            }
        }
    }

    /// Cancellation always lands at the end of the paid period, never immediately.
    async fn set_cancel_at_period_end(
        &self,
        organization: &Organization,
        cancel: bool,
    ) -> Result<ActionResponse, BillingError> {
        let current = self.current_subscription(organization).await?;
        let updated = bounded(
            self.timeouts().processor,
            "subscription cancel toggle",
            self.processor
                .set_cancel_at_period_end(&current.stripe_subscription_id, cancel),
        )
        .await?;
        let message = if cancel {
            "subscription will cancel at the end of the current period"
        } else {
            "subscription reactivated"
        };
        Ok(ActionResponse {
            subscription_id: Some(updated.id),
            ..ActionResponse::ok()
        }
        .with_message(message))
    }

    /// Appends a usage ledger entry for the billing period containing `now`.
    pub async fn record_usage(
        &self,
        organization: &Organization,
        request: UsageRequest,
        now: DateTime<Utc>,
    ) -> Result<UsageRecord, BillingError> {
        if request.quantity <= 0 {
            return Err(BillingError::validation("quantity must be positive"));
        }
        if request.quantity > MAX_USAGE_QUANTITY {
            return Err(BillingError::validation(format!(
                "quantity must not exceed {MAX_USAGE_QUANTITY}"
            )));
        }
        let unit_price = request
            .unit_price
            .unwrap_or_else(|| request.usage_type.default_unit_price());
        if !(0..=MAX_USAGE_UNIT_PRICE).contains(&unit_price) {
            return Err(BillingError::validation(format!(
                "unitPrice must be between 0 and {MAX_USAGE_UNIT_PRICE}"
            )));
        }
        let store_limit = self.timeouts().store;
        let subscription = bounded(
            store_limit,
            "subscription lookup",
            self.store.latest_subscription(organization.id),
        )
        .await?;
        let record = UsageRecord::new(
            organization.id,
            subscription.map(|row| row.id),
            request.usage_type,
            request.quantity,
            unit_price,
            &BillingPeriod::containing(now),
            request.description,
            now,
        )
        .ok_or_else(|| BillingError::validation("usage total is out of range"))?;
        bounded(store_limit, "usage insert", self.store.insert_usage_record(&record)).await?;
        info!(
            organization_id = organization.id,
            usage_type = record.usage_type.as_str(),
            quantity = record.quantity,
            total_price = record.total_price,
            "usage recorded"
        );
        Ok(record)
    }

    /// Decides whether `organization` may consume `check`'s resource right now.
    pub async fn check_entitlement(
        &self,
        organization: &Organization,
        check: EntitlementCheck,
        now: DateTime<Utc>,
    ) -> Result<EntitlementDecision, BillingError> {
        let store_limit = self.timeouts().store;
        let store = self.store.as_ref();
        let plan = organization.plan.as_str();
        let decision = match check {
            EntitlementCheck::PhoneNumber => {
                let count = bounded(
                    store_limit,
                    "phone number count",
                    usage::count_phone_numbers(store, organization.id),
                )
                .await?;
                EntitlementDecision::Cap(can_add_phone_number(plan, count))
            }
            EntitlementCheck::Extension => {
                let count = bounded(
                    store_limit,
                    "extension count",
                    usage::count_extensions(store, organization.id),
                )
                .await?;
                EntitlementDecision::Cap(check_extension_limit(plan, count))
            }
            EntitlementCheck::Sms => {
                let count = bounded(
                    store_limit,
                    "sms count",
                    usage::count_monthly_sms(store, organization.id, now),
                )
                .await?;
                EntitlementDecision::Sms(can_send_sms(plan, count))
            }
            EntitlementCheck::AiFeature { feature } => {
                let feature = required("feature", &feature)?;
                EntitlementDecision::AiFeature(can_use_ai_feature(plan, feature))
            }
            EntitlementCheck::Api => EntitlementDecision::Api(can_access_api(plan)),
        };
        if !decision.allowed() {
            info!(organization_id = organization.id, plan, "entitlement denied");
        }
        Ok(decision)
    }
}
