use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::catalog::PlanKey;
use super::error::{bounded, BillingError, BillingTimeouts};
use super::events::{
    decode_event, verify_signature, WebhookError, WebhookEvent, WebhookEventKind,
};
use super::models::{InvoiceStatus, Organization, SubscriptionStatus, SubscriptionUpsert};
use super::notifications::{NotificationHandle, Notice};
use super::processor::{from_unix, PaymentProcessor, ProcessorInvoice, ProcessorSubscription};
use super::store::{BillingStore, NewInvoice};
use crate::config::{
    PlanPriceIds, BILLING_PAST_DUE_GRACE_DAYS, BILLING_PAYMENT_RETRY_DAYS, STRIPE_PRICE_IDS,
    STRIPE_WEBHOOK_SECRET,
};

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub secret: String,
    pub prices: PlanPriceIds,
    pub timeouts: BillingTimeouts,
    pub payment_retry_days: i64,
    pub past_due_grace_days: i64,
}

impl WebhookSettings {
    pub fn from_config() -> Self {
        Self {
            secret: STRIPE_WEBHOOK_SECRET.clone(),
            prices: STRIPE_PRICE_IDS.clone(),
            timeouts: BillingTimeouts::from_config(),
            payment_retry_days: *BILLING_PAYMENT_RETRY_DAYS,
            past_due_grace_days: *BILLING_PAST_DUE_GRACE_DAYS,
        }
    }
}

/// What happened to a verified event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Local state was mutated.
    Applied,
    /// The event id was already in the ledger.
    Duplicate,
    /// Event type with no local effect.
    Ignored,
    /// No tenant could be attached to the event.
    Discarded,
    /// A newer event already wrote the subscription row.
    Stale,
}

/// key: billing-webhooks -> reconciles local state with processor events
#[derive(Clone)]
pub struct WebhookProcessor {
    store: Arc<dyn BillingStore>,
    processor: Arc<dyn PaymentProcessor>,
    notifications: NotificationHandle,
    settings: WebhookSettings,
}

impl WebhookProcessor {
    pub fn new(
        store: Arc<dyn BillingStore>,
        processor: Arc<dyn PaymentProcessor>,
        notifications: NotificationHandle,
        settings: WebhookSettings,
    ) -> Self {
        Self {
            store,
            processor,
            notifications,
            settings,
        }
    }

    pub fn verify(
        &self,
        payload: &[u8],
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<(), WebhookError> {
        verify_signature(payload, signature, &self.settings.secret, now)
    }

    pub fn decode(&self, payload: &[u8]) -> Result<WebhookEvent, WebhookError> {
        decode_event(payload)
    }

    /// Applies `event` at most once. The ledger entry is only written after the handler
    /// succeeds, so a failed event is retried by the processor's redelivery.
    pub async fn handle(&self, event: &WebhookEvent) -> Result<WebhookOutcome, BillingError> {
        let store_limit = self.settings.timeouts.store;
        if bounded(
            store_limit,
            "webhook ledger read",
            self.store.is_event_processed(&event.id),
        )
        .await?
        {
            info!(event_id = %event.id, event_type = %event.event_type, "duplicate webhook event");
            return Ok(WebhookOutcome::Duplicate);
        }

        let outcome = match &event.kind {
            WebhookEventKind::SubscriptionCreated(subscription)
            | WebhookEventKind::SubscriptionUpdated(subscription) => {
                self.subscription_changed(event, subscription).await?
            }
            WebhookEventKind::SubscriptionDeleted(subscription) => {
                self.subscription_deleted(event, subscription).await?
            }
            WebhookEventKind::InvoicePaid(invoice) => self.invoice_paid(event, invoice).await?,
            WebhookEventKind::InvoicePaymentFailed(invoice) => {
                self.invoice_payment_failed(event, invoice).await?
            }
            WebhookEventKind::TrialWillEnd(subscription) => {
                self.trial_will_end(event, subscription).await?
            }
            WebhookEventKind::Other => {
                info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "ignoring unhandled webhook event"
                );
                WebhookOutcome::Ignored
            }
        };

        bounded(
            store_limit,
            "webhook ledger write",
            self.store.mark_event_processed(&event.id, &event.event_type),
        )
        .await?;
        Ok(outcome)
    }

    async fn tenant(
        &self,
        event: &WebhookEvent,
        organization_id: Option<i32>,
    ) -> Result<Option<Organization>, BillingError> {
        let Some(organization_id) = organization_id else {
            warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                "webhook event has no organization metadata, discarding"
            );
            return Ok(None);
        };
        let organization = bounded(
            self.settings.timeouts.store,
            "organization lookup",
            self.store.organization(organization_id),
        )
        .await?;
        if organization.is_none() {
            warn!(
                event_id = %event.id,
                %organization_id,
                "webhook event references unknown organization, discarding"
            );
        }
        Ok(organization)
    }

    fn plan_for_subscription(&self, subscription: &ProcessorSubscription) -> Option<PlanKey> {
        subscription
            .plan_metadata()
            .and_then(|plan| plan.parse::<PlanKey>().ok())
            .or_else(|| {
                subscription
                    .price_id()
                    .and_then(|price| self.settings.prices.plan_for(price))
            })
    }

    async fn subscription_changed(
        &self,
        event: &WebhookEvent,
        subscription: &ProcessorSubscription,
    ) -> Result<WebhookOutcome, BillingError> {
        let Some(organization) = self.tenant(event, subscription.organization_id()).await? else {
            return Ok(WebhookOutcome::Discarded);
        };
        let status = SubscriptionStatus::from_processor(&subscription.status);
        let plan = self.plan_for_subscription(subscription);
        let record = SubscriptionUpsert {
            organization_id: organization.id,
            stripe_subscription_id: subscription.id.clone(),
            stripe_customer_id: subscription.customer.clone(),
            stripe_price_id: subscription.price_id().map(str::to_string),
            plan_id: plan
                .map(|plan| plan.as_str().to_string())
                .unwrap_or_else(|| organization.plan.clone()),
            status,
            current_period_start: subscription.current_period_start.and_then(from_unix),
            current_period_end: subscription.current_period_end.and_then(from_unix),
            cancel_at_period_end: subscription.cancel_at_period_end,
            trial_ends_at: subscription.trial_end.and_then(from_unix),
            canceled_at: subscription.canceled_at.and_then(from_unix),
            last_event_at: event.created,
        };

        let limit = self.settings.timeouts.store;
        let written = bounded(limit, "subscription upsert", self.store.upsert_subscription(&record))
            .await?;
        if written.is_none() {
            info!(
                event_id = %event.id,
                subscription = %subscription.id,
                organization_id = organization.id,
                "stale subscription event, newer state already stored"
            );
            return Ok(WebhookOutcome::Stale);
        }

        bounded(
            limit,
            "organization status update",
            self.store.set_billing_status(organization.id, status),
        )
        .await?;
        info!(
            event_id = %event.id,
            subscription = %subscription.id,
            organization_id = organization.id,
            status = status.as_str(),
            "subscription synchronized"
        );
        Ok(WebhookOutcome::Applied)
    }

    async fn subscription_deleted(
        &self,
        event: &WebhookEvent,
        subscription: &ProcessorSubscription,
    ) -> Result<WebhookOutcome, BillingError> {
        let Some(organization) = self.tenant(event, subscription.organization_id()).await? else {
            return Ok(WebhookOutcome::Discarded);
        };
        let canceled_at = subscription
            .canceled_at
            .and_then(from_unix)
            .unwrap_or(event.created);
        let limit = self.settings.timeouts.store;

        let updated = bounded(
            limit,
            "subscription cancel",
            self.store
                .mark_subscription_canceled(&subscription.id, canceled_at, event.created),
        )
        .await?;
        if updated.is_none() {
            // No local row yet; keep a canceled record so the history is complete.
            let record = SubscriptionUpsert {
                organization_id: organization.id,
                stripe_subscription_id: subscription.id.clone(),
                stripe_customer_id: subscription.customer.clone(),
                stripe_price_id: subscription.price_id().map(str::to_string),
                plan_id: self
                    .plan_for_subscription(subscription)
                    .map(|plan| plan.as_str().to_string())
                    .unwrap_or_else(|| organization.plan.clone()),
                status: SubscriptionStatus::Canceled,
                current_period_start: subscription.current_period_start.and_then(from_unix),
                current_period_end: subscription.current_period_end.and_then(from_unix),
                cancel_at_period_end: subscription.cancel_at_period_end,
                trial_ends_at: subscription.trial_end.and_then(from_unix),
                canceled_at: Some(canceled_at),
                last_event_at: event.created,
            };
            bounded(limit, "subscription upsert", self.store.upsert_subscription(&record)).await?;
        }

        bounded(
            limit,
            "organization status update",
            self.store
                .set_billing_status(organization.id, SubscriptionStatus::Canceled),
        )
        .await?;
        info!(
            event_id = %event.id,
            subscription = %subscription.id,
            organization_id = organization.id,
            "subscription canceled"
        );
        Ok(WebhookOutcome::Applied)
    }

    fn new_invoice(
        organization: &Organization,
        invoice: &ProcessorInvoice,
        invoice_id: &str,
        status: InvoiceStatus,
        fallback_paid_at: DateTime<Utc>,
    ) -> NewInvoice {
        let paid = status == InvoiceStatus::Paid;
        NewInvoice {
            organization_id: organization.id,
            stripe_invoice_id: invoice_id.to_string(),
            stripe_subscription_id: invoice.subscription.clone(),
            amount_due: invoice.amount_due,
            amount_paid: if paid { invoice.amount_paid } else { 0 },
            currency: invoice.currency.clone(),
            status,
            hosted_invoice_url: invoice.hosted_invoice_url.clone(),
            invoice_pdf: invoice.invoice_pdf.clone(),
            period_start: invoice.period_start.and_then(from_unix),
            period_end: invoice.period_end.and_then(from_unix),
            paid_at: paid.then(|| {
                invoice
                    .status_transitions
                    .paid_at
                    .and_then(from_unix)
                    .unwrap_or(fallback_paid_at)
            }),
        }
    }

    fn plan_name(organization: &Organization, invoice: &ProcessorInvoice) -> String {
        invoice
            .plan_metadata()
            .and_then(|plan| plan.parse::<PlanKey>().ok())
            .unwrap_or_else(|| organization.plan_key())
            .definition()
            .name
            .to_string()
    }

    async fn invoice_paid(
        &self,
        event: &WebhookEvent,
        invoice: &ProcessorInvoice,
    ) -> Result<WebhookOutcome, BillingError> {
        let Some(organization) = self.tenant(event, invoice.organization_id()).await? else {
            return Ok(WebhookOutcome::Discarded);
        };
        let Some(invoice_id) = invoice.id.as_deref() else {
            warn!(event_id = %event.id, "paid invoice has no id, discarding");
            return Ok(WebhookOutcome::Discarded);
        };
        let row = Self::new_invoice(
            &organization,
            invoice,
            invoice_id,
            InvoiceStatus::Paid,
            event.created,
        );
        let inserted = bounded(
            self.settings.timeouts.store,
            "invoice insert",
            self.store.insert_invoice(&row),
        )
        .await?;
        if !inserted {
            info!(event_id = %event.id, invoice = invoice_id, "paid invoice already recorded");
            return Ok(WebhookOutcome::Applied);
        }

        self.notifications.dispatch(Notice::PaymentConfirmation {
            organization_id: organization.id,
            recipient: organization
                .billing_email
                .clone()
                .or_else(|| invoice.customer_email.clone()),
            customer_name: invoice
                .customer_name
                .clone()
                .or_else(|| Some(organization.name.clone())),
            plan_name: Self::plan_name(&organization, invoice),
            invoice_id: invoice_id.to_string(),
            amount_paid: row.amount_paid,
            currency: row.currency.clone(),
            paid_at: row.paid_at.unwrap_or(event.created),
            invoice_url: row.hosted_invoice_url.clone(),
        });
        info!(
            event_id = %event.id,
            invoice = invoice_id,
            organization_id = organization.id,
            amount_paid = row.amount_paid,
            "invoice paid"
        );
        Ok(WebhookOutcome::Applied)
    }

    async fn invoice_payment_failed(
        &self,
        event: &WebhookEvent,
        invoice: &ProcessorInvoice,
    ) -> Result<WebhookOutcome, BillingError> {
        let Some(organization) = self.tenant(event, invoice.organization_id()).await? else {
            return Ok(WebhookOutcome::Discarded);
        };
        let Some(invoice_id) = invoice.id.as_deref() else {
            warn!(event_id = %event.id, "failed invoice has no id, discarding");
            return Ok(WebhookOutcome::Discarded);
        };
        let limit = self.settings.timeouts.store;
        let row = Self::new_invoice(
            &organization,
            invoice,
            invoice_id,
            InvoiceStatus::Failed,
            event.created,
        );
        let inserted = bounded(limit, "invoice insert", self.store.insert_invoice(&row)).await?;
        bounded(
            limit,
            "organization status update",
            self.store
                .set_billing_status(organization.id, SubscriptionStatus::PastDue),
        )
        .await?;
        if !inserted {
            info!(event_id = %event.id, invoice = invoice_id, "failed invoice already recorded");
            return Ok(WebhookOutcome::Applied);
        }

        let now = Utc::now();
        let retry_at = invoice
            .next_payment_attempt
            .and_then(from_unix)
            .unwrap_or_else(|| now + Duration::days(self.settings.payment_retry_days));
        let suspension_at = now + Duration::days(self.settings.past_due_grace_days);
        let customer_id = invoice
            .customer
            .clone()
            .or_else(|| organization.stripe_customer_id.clone());
        let payment_method = match customer_id {
            Some(customer_id) => self.masked_card(&customer_id).await,
            None => None,
        };

        self.notifications.dispatch(Notice::PaymentFailed {
            organization_id: organization.id,
            recipient: organization
                .billing_email
                .clone()
                .or_else(|| invoice.customer_email.clone()),
            customer_name: invoice
                .customer_name
                .clone()
                .or_else(|| Some(organization.name.clone())),
            plan_name: Self::plan_name(&organization, invoice),
            invoice_id: invoice_id.to_string(),
            amount_due: row.amount_due,
            currency: row.currency.clone(),
            payment_method,
            retry_at,
            suspension_at,
            invoice_url: row.hosted_invoice_url.clone(),
        });
        warn!(
            event_id = %event.id,
            invoice = invoice_id,
            organization_id = organization.id,
            attempt = invoice.attempt_count.unwrap_or_default(),
            "invoice payment failed"
        );
        Ok(WebhookOutcome::Applied)
    }

    /// Best effort: the notice goes out without card details if the lookup fails.
    async fn masked_card(&self, customer_id: &str) -> Option<String> {
        match bounded(
            self.settings.timeouts.processor,
            "payment method lookup",
            self.processor.list_payment_methods(customer_id),
        )
        .await
        {
            Ok(methods) => methods.first().and_then(|method| method.masked()),
            Err(err) => {
                warn!(?err, customer = customer_id, "payment method lookup failed");
                None
            }
        }
    }

    async fn trial_will_end(
        &self,
        event: &WebhookEvent,
        subscription: &ProcessorSubscription,
    ) -> Result<WebhookOutcome, BillingError> {
        let Some(organization) = self.tenant(event, subscription.organization_id()).await? else {
            return Ok(WebhookOutcome::Discarded);
        };
        let Some(trial_ends_at) = subscription.trial_end.and_then(from_unix) else {
            warn!(
                event_id = %event.id,
                subscription = %subscription.id,
                "trial ending event without trial end, ignoring"
            );
            return Ok(WebhookOutcome::Ignored);
        };
        let plan = self
            .plan_for_subscription(subscription)
            .unwrap_or_else(|| organization.plan_key());

        self.notifications.dispatch(Notice::TrialEnding {
            organization_id: organization.id,
            recipient: organization.billing_email.clone(),
            customer_name: Some(organization.name.clone()),
            plan_name: plan.definition().name.to_string(),
            trial_ends_at,
            days_remaining: days_until(trial_ends_at, Utc::now()),
        });
        info!(
            event_id = %event.id,
            subscription = %subscription.id,
            organization_id = organization.id,
            "trial ending notice queued"
        );
        Ok(WebhookOutcome::Applied)
    }
}

/// Whole days left before `deadline`, rounded up and never negative.
pub fn days_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let seconds = (deadline - now).num_seconds();
    if seconds <= 0 {
        0
    } else {
        (seconds + 86_399) / 86_400
    }
}
