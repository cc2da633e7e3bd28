use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::models::{
    BillingPeriod, Invoice, Organization, PhoneNumberKind, Subscription, SubscriptionStatus,
    SubscriptionUpsert, UsageRecord, UsageType,
};
use super::store::{BillingStore, NewInvoice};

/// key: billing-store-memory -> in-process store for tests and local runs
#[derive(Default, Clone)]
pub struct InMemoryBillingStore {
    inner: Arc<RwLock<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    next_organization_id: i32,
    organizations: HashMap<i32, Organization>,
    subscriptions: Vec<Subscription>,
    invoices: Vec<Invoice>,
    phone_numbers: Vec<PhoneNumberEntry>,
    sms_messages: Vec<SmsEntry>,
    extensions: Vec<i32>,
    usage_records: Vec<UsageRecord>,
    processed_events: HashSet<String>,
}

struct PhoneNumberEntry {
    id: Uuid,
    organization_id: i32,
    kind: PhoneNumberKind,
    active: bool,
}

struct SmsEntry {
    phone_number_id: Uuid,
    outbound: bool,
    sent_at: DateTime<Utc>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an organization on `plan` and returns it with its assigned id.
    pub async fn add_organization(
        &self,
        external_id: &str,
        name: &str,
        plan: &str,
    ) -> Organization {
        let mut state = self.inner.write().await;
        state.next_organization_id += 1;
        let organization = Organization {
            id: state.next_organization_id,
            external_id: external_id.to_string(),
            name: name.to_string(),
            plan: plan.to_string(),
            billing_status: None,
            stripe_customer_id: None,
            billing_email: Some(format!("billing@{external_id}.example")),
        };
        state
            .organizations
            .insert(organization.id, organization.clone());
        organization
    }

    pub async fn add_phone_number(&self, organization_id: i32, kind: PhoneNumberKind) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.write().await.phone_numbers.push(PhoneNumberEntry {
            id,
            organization_id,
            kind,
            active: true,
        });
        id
    }

    pub async fn release_phone_number(&self, phone_number_id: Uuid) {
        let mut state = self.inner.write().await;
        if let Some(entry) = state
            .phone_numbers
            .iter_mut()
            .find(|entry| entry.id == phone_number_id)
        {
            entry.active = false;
        }
    }

    pub async fn add_sms(&self, phone_number_id: Uuid, outbound: bool, sent_at: DateTime<Utc>) {
        self.inner.write().await.sms_messages.push(SmsEntry {
            phone_number_id,
            outbound,
            sent_at,
        });
    }

    pub async fn add_extension(&self, organization_id: i32) {
        self.inner.write().await.extensions.push(organization_id);
    }

    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.read().await.subscriptions.clone()
    }

    pub async fn invoices(&self) -> Vec<Invoice> {
        self.inner.read().await.invoices.clone()
    }

    pub async fn usage_records(&self) -> Vec<UsageRecord> {
        self.inner.read().await.usage_records.clone()
    }

    pub async fn processed_events(&self) -> Vec<String> {
        self.inner
            .read()
            .await
            .processed_events
            .iter()
            .cloned()
            .collect()
    }

    async fn update_organization(
        &self,
        organization_id: i32,
        apply: impl FnOnce(&mut Organization) + Send,
    ) {
        if let Some(organization) = self
            .inner
            .write()
            .await
            .organizations
            .get_mut(&organization_id)
        {
            apply(organization);
        }
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn organization(&self, organization_id: i32) -> sqlx::Result<Option<Organization>> {
        Ok(self
            .inner
            .read()
            .await
            .organizations
            .get(&organization_id)
            .cloned())
    }

    async fn organization_by_external_id(
        &self,
        external_id: &str,
    ) -> sqlx::Result<Option<Organization>> {
        Ok(self
            .inner
            .read()
            .await
            .organizations
            .values()
            .find(|organization| organization.external_id == external_id)
            .cloned())
    }

    async fn set_billing_status(
        &self,
        organization_id: i32,
        status: SubscriptionStatus,
    ) -> sqlx::Result<()> {
        self.update_organization(organization_id, |organization| {
            organization.billing_status = Some(status)
        })
        .await;
        Ok(())
    }

    async fn set_stripe_customer_id(
        &self,
        organization_id: i32,
        customer_id: &str,
    ) -> sqlx::Result<()> {
        self.update_organization(organization_id, |organization| {
            organization.stripe_customer_id = Some(customer_id.to_string())
        })
        .await;
        Ok(())
    }

    async fn latest_subscription(
        &self,
        organization_id: i32,
    ) -> sqlx::Result<Option<Subscription>> {
        // Vec order is insertion order, so the last match is the most recently created.
        Ok(self
            .inner
            .read()
            .await
            .subscriptions
            .iter()
            .rev()
            .find(|subscription| subscription.organization_id == organization_id)
            .cloned())
    }

    async fn upsert_subscription(
        &self,
        record: &SubscriptionUpsert,
    ) -> sqlx::Result<Option<Subscription>> {
        let mut state = self.inner.write().await;
        let now = Utc::now();
        if let Some(existing) = state
            .subscriptions
            .iter_mut()
            .find(|row| row.stripe_subscription_id == record.stripe_subscription_id)
        {
            if existing.last_event_at > record.last_event_at {
                return Ok(None);
            }
            existing.organization_id = record.organization_id;
            existing.stripe_customer_id = record.stripe_customer_id.clone();
            existing.stripe_price_id = record.stripe_price_id.clone();
            existing.plan_id = record.plan_id.clone();
            existing.status = record.status;
            existing.current_period_start = record.current_period_start;
            existing.current_period_end = record.current_period_end;
            existing.cancel_at_period_end = record.cancel_at_period_end;
            existing.trial_ends_at = record.trial_ends_at;
            existing.canceled_at = record.canceled_at;
            existing.last_event_at = record.last_event_at;
            existing.updated_at = now;
            return Ok(Some(existing.clone()));
        }

        let row = Subscription {
            id: Uuid::new_v4(),
            organization_id: record.organization_id,
            stripe_subscription_id: record.stripe_subscription_id.clone(),
            stripe_customer_id: record.stripe_customer_id.clone(),
            stripe_price_id: record.stripe_price_id.clone(),
            plan_id: record.plan_id.clone(),
            status: record.status,
            current_period_start: record.current_period_start,
            current_period_end: record.current_period_end,
            cancel_at_period_end: record.cancel_at_period_end,
            trial_ends_at: record.trial_ends_at,
            canceled_at: record.canceled_at,
            last_event_at: record.last_event_at,
            created_at: now,
            updated_at: now,
        };
        state.subscriptions.push(row.clone());
        Ok(Some(row))
    }

    async fn mark_subscription_canceled(
        &self,
        stripe_subscription_id: &str,
        canceled_at: DateTime<Utc>,
        event_at: DateTime<Utc>,
    ) -> sqlx::Result<Option<Subscription>> {
        let mut state = self.inner.write().await;
        let Some(existing) = state
            .subscriptions
            .iter_mut()
            .find(|row| row.stripe_subscription_id == stripe_subscription_id)
        else {
            return Ok(None);
        };
        existing.status = SubscriptionStatus::Canceled;
        existing.canceled_at = Some(existing.canceled_at.unwrap_or(canceled_at));
        existing.last_event_at = existing.last_event_at.max(event_at);
        existing.updated_at = Utc::now();
        Ok(Some(existing.clone()))
    }

    async fn insert_invoice(&self, invoice: &NewInvoice) -> sqlx::Result<bool> {
        let mut state = self.inner.write().await;
        let duplicate = state.invoices.iter().any(|row| {
            row.stripe_invoice_id == invoice.stripe_invoice_id && row.status == invoice.status
        });
        if duplicate {
            return Ok(false);
        }
        state.invoices.push(Invoice {
            id: Uuid::new_v4(),
            organization_id: invoice.organization_id,
            stripe_invoice_id: invoice.stripe_invoice_id.clone(),
            stripe_subscription_id: invoice.stripe_subscription_id.clone(),
            amount_due: invoice.amount_due,
            amount_paid: invoice.amount_paid,
            currency: invoice.currency.clone(),
            status: invoice.status,
            hosted_invoice_url: invoice.hosted_invoice_url.clone(),
            invoice_pdf: invoice.invoice_pdf.clone(),
            period_start: invoice.period_start,
            period_end: invoice.period_end,
            paid_at: invoice.paid_at,
            created_at: Utc::now(),
        });
        Ok(true)
    }

    async fn recent_invoices(
        &self,
        organization_id: i32,
        limit: i64,
    ) -> sqlx::Result<Vec<Invoice>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .inner
            .read()
            .await
            .invoices
            .iter()
            .rev()
            .filter(|invoice| invoice.organization_id == organization_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_phone_numbers(
        &self,
        organization_id: i32,
        kind: Option<PhoneNumberKind>,
    ) -> sqlx::Result<i64> {
        let count = self
            .inner
            .read()
            .await
            .phone_numbers
            .iter()
            .filter(|entry| entry.organization_id == organization_id && entry.active)
            .filter(|entry| kind.map_or(true, |kind| entry.kind == kind))
            .count();
        Ok(count as i64)
    }

    async fn count_outbound_sms(
        &self,
        organization_id: i32,
        period: &BillingPeriod,
    ) -> sqlx::Result<i64> {
        let state = self.inner.read().await;
        let owned: HashSet<Uuid> = state
            .phone_numbers
            .iter()
            .filter(|entry| entry.organization_id == organization_id)
            .map(|entry| entry.id)
            .collect();
        let count = state
            .sms_messages
            .iter()
            .filter(|sms| sms.outbound && owned.contains(&sms.phone_number_id))
            .filter(|sms| period.contains(sms.sent_at))
            .count();
        Ok(count as i64)
    }

    async fn count_extensions(&self, organization_id: i32) -> sqlx::Result<i64> {
        let count = self
            .inner
            .read()
            .await
            .extensions
            .iter()
            .filter(|owner| **owner == organization_id)
            .count();
        Ok(count as i64)
    }

    async fn insert_usage_record(&self, record: &UsageRecord) -> sqlx::Result<()> {
        self.inner
            .write()
            .await
            .usage_records
            .push(record.clone());
        Ok(())
    }

    async fn sum_usage(
        &self,
        organization_id: i32,
        usage_type: UsageType,
        period: &BillingPeriod,
    ) -> sqlx::Result<i64> {
        Ok(self
            .inner
            .read()
            .await
            .usage_records
            .iter()
            .filter(|record| {
                record.organization_id == organization_id
                    && record.usage_type == usage_type
                    && period.contains(record.created_at)
            })
            .fold(0i64, |total, record| total.saturating_add(record.quantity)))
    }

    async fn is_event_processed(&self, event_id: &str) -> sqlx::Result<bool> {
        Ok(self
            .inner
            .read()
            .await
            .processed_events
            .contains(event_id))
    }

    async fn mark_event_processed(&self, event_id: &str, _event_type: &str) -> sqlx::Result<()> {
        self.inner
            .write()
            .await
            .processed_events
            .insert(event_id.to_string());
        Ok(())
    }
}
