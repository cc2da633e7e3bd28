use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::models::{
    BillingPeriod, Invoice, InvoiceStatus, Organization, PhoneNumberKind, Subscription,
    SubscriptionStatus, SubscriptionUpsert, UsageRecord, UsageType,
};

/// Invoice fields captured from a webhook; the store assigns the row id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewInvoice {
    pub organization_id: i32,
    pub stripe_invoice_id: String,
    pub stripe_subscription_id: Option<String>,
    pub amount_due: i64,
    pub amount_paid: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub hosted_invoice_url: Option<String>,
    pub invoice_pdf: Option<String>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
}

/// key: billing-store -> persistence seam for the billing core
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn organization(&self, organization_id: i32) -> sqlx::Result<Option<Organization>>;
    async fn organization_by_external_id(
        &self,
        external_id: &str,
    ) -> sqlx::Result<Option<Organization>>;
    async fn set_billing_status(
        &self,
        organization_id: i32,
        status: SubscriptionStatus,
    ) -> sqlx::Result<()>;
    async fn set_stripe_customer_id(
        &self,
        organization_id: i32,
        customer_id: &str,
    ) -> sqlx::Result<()>;

    async fn latest_subscription(&self, organization_id: i32)
        -> sqlx::Result<Option<Subscription>>;
    /// Atomic insert-or-update keyed by the processor subscription id. Returns `None` when the
    /// stored row carries a newer `last_event_at` than the incoming write.
    async fn upsert_subscription(
        &self,
        record: &SubscriptionUpsert,
    ) -> sqlx::Result<Option<Subscription>>;
    async fn mark_subscription_canceled(
        &self,
        stripe_subscription_id: &str,
        canceled_at: DateTime<Utc>,
        event_at: DateTime<Utc>,
    ) -> sqlx::Result<Option<Subscription>>;

    /// Returns `false` when the same processor invoice was already recorded with this status.
    async fn insert_invoice(&self, invoice: &NewInvoice) -> sqlx::Result<bool>;
    async fn recent_invoices(&self, organization_id: i32, limit: i64) -> sqlx::Result<Vec<Invoice>>;

    async fn count_phone_numbers(
        &self,
        organization_id: i32,
        kind: Option<PhoneNumberKind>,
    ) -> sqlx::Result<i64>;
    async fn count_outbound_sms(
        &self,
        organization_id: i32,
        period: &BillingPeriod,
    ) -> sqlx::Result<i64>;
    async fn count_extensions(&self, organization_id: i32) -> sqlx::Result<i64>;

    async fn insert_usage_record(&self, record: &UsageRecord) -> sqlx::Result<()>;
    async fn sum_usage(
        &self,
        organization_id: i32,
        usage_type: UsageType,
        period: &BillingPeriod,
    ) -> sqlx::Result<i64>;

    async fn is_event_processed(&self, event_id: &str) -> sqlx::Result<bool>;
    async fn mark_event_processed(&self, event_id: &str, event_type: &str) -> sqlx::Result<()>;
}

/// Postgres-backed [`BillingStore`].
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct OrganizationRow {
    id: i32,
    external_id: String,
    name: String,
    plan: String,
    billing_status: Option<String>,
    stripe_customer_id: Option<String>,
    billing_email: Option<String>,
}

impl From<OrganizationRow> for Organization {
    fn from(row: OrganizationRow) -> Self {
        Organization {
            id: row.id,
            external_id: row.external_id,
            name: row.name,
            plan: row.plan,
            billing_status: row
                .billing_status
                .as_deref()
                .map(SubscriptionStatus::from_stored),
            stripe_customer_id: row.stripe_customer_id,
            billing_email: row.billing_email,
        }
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: Uuid,
    organization_id: i32,
    stripe_subscription_id: String,
    stripe_customer_id: String,
    stripe_price_id: Option<String>,
    plan_id: String,
    status: String,
    current_period_start: Option<DateTime<Utc>>,
    current_period_end: Option<DateTime<Utc>>,
    cancel_at_period_end: bool,
    trial_ends_at: Option<DateTime<Utc>>,
    canceled_at: Option<DateTime<Utc>>,
    last_event_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        Subscription {
            id: row.id,
            organization_id: row.organization_id,
            stripe_subscription_id: row.stripe_subscription_id,
            stripe_customer_id: row.stripe_customer_id,
            stripe_price_id: row.stripe_price_id,
            plan_id: row.plan_id,
            status: SubscriptionStatus::from_stored(&row.status),
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            trial_ends_at: row.trial_ends_at,
            canceled_at: row.canceled_at,
            last_event_at: row.last_event_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct InvoiceRow {
    id: Uuid,
    organization_id: i32,
    stripe_invoice_id: String,
    stripe_subscription_id: Option<String>,
    amount_due: i64,
    amount_paid: i64,
    currency: String,
    status: String,
    hosted_invoice_url: Option<String>,
    invoice_pdf: Option<String>,
    period_start: Option<DateTime<Utc>>,
    period_end: Option<DateTime<Utc>>,
    paid_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<InvoiceRow> for Invoice {
    fn from(row: InvoiceRow) -> Self {
        Invoice {
            id: row.id,
            organization_id: row.organization_id,
            stripe_invoice_id: row.stripe_invoice_id,
            stripe_subscription_id: row.stripe_subscription_id,
            amount_due: row.amount_due,
            amount_paid: row.amount_paid,
            currency: row.currency,
            status: InvoiceStatus::from_stored(&row.status),
            hosted_invoice_url: row.hosted_invoice_url,
            invoice_pdf: row.invoice_pdf,
            period_start: row.period_start,
            period_end: row.period_end,
            paid_at: row.paid_at,
            created_at: row.created_at,
        }
    }
}

const ORGANIZATION_COLUMNS: &str =
    "id, external_id, name, plan, billing_status, stripe_customer_id, billing_email";

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn organization(&self, organization_id: i32) -> sqlx::Result<Option<Organization>> {
        let row = sqlx::query_as::<_, OrganizationRow>(&format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE id = $1"
        ))
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Organization::from))
    }

    async fn organization_by_external_id(
        &self,
        external_id: &str,
    ) -> sqlx::Result<Option<Organization>> {
        let row = sqlx::query_as::<_, OrganizationRow>(&format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE external_id = $1"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Organization::from))
    }

    async fn set_billing_status(
        &self,
        organization_id: i32,
        status: SubscriptionStatus,
    ) -> sqlx::Result<()> {
        sqlx::query(
            "UPDATE organizations SET billing_status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(organization_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_stripe_customer_id(
        &self,
        organization_id: i32,
        customer_id: &str,
    ) -> sqlx::Result<()> {
        sqlx::query(
            "UPDATE organizations SET stripe_customer_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(organization_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_subscription(
        &self,
        organization_id: i32,
    ) -> sqlx::Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT * FROM subscriptions
            WHERE organization_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Subscription::from))
    }

    async fn upsert_subscription(
        &self,
        record: &SubscriptionUpsert,
    ) -> sqlx::Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            INSERT INTO subscriptions (
                id,
                organization_id,
                stripe_subscription_id,
                stripe_customer_id,
                stripe_price_id,
                plan_id,
                status,
                current_period_start,
                current_period_end,
                cancel_at_period_end,
                trial_ends_at,
                canceled_at,
                last_event_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (stripe_subscription_id)
            DO UPDATE SET
                organization_id = EXCLUDED.organization_id,
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                stripe_price_id = EXCLUDED.stripe_price_id,
                plan_id = EXCLUDED.plan_id,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                trial_ends_at = EXCLUDED.trial_ends_at,
                canceled_at = EXCLUDED.canceled_at,
                last_event_at = EXCLUDED.last_event_at,
                updated_at = NOW()
            WHERE subscriptions.last_event_at <= EXCLUDED.last_event_at
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(record.organization_id)
        .bind(&record.stripe_subscription_id)
        .bind(&record.stripe_customer_id)
        .bind(&record.stripe_price_id)
        .bind(&record.plan_id)
        .bind(record.status.as_str())
        .bind(record.current_period_start)
        .bind(record.current_period_end)
        .bind(record.cancel_at_period_end)
        .bind(record.trial_ends_at)
        .bind(record.canceled_at)
        .bind(record.last_event_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Subscription::from))
    }

    async fn mark_subscription_canceled(
        &self,
        stripe_subscription_id: &str,
        canceled_at: DateTime<Utc>,
        event_at: DateTime<Utc>,
    ) -> sqlx::Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            UPDATE subscriptions
            SET status = 'canceled',
                canceled_at = COALESCE(canceled_at, $2),
                last_event_at = GREATEST(last_event_at, $3),
                updated_at = NOW()
            WHERE stripe_subscription_id = $1
            RETURNING *
            "#,
        )
        .bind(stripe_subscription_id)
        .bind(canceled_at)
        .bind(event_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Subscription::from))
    }

    async fn insert_invoice(&self, invoice: &NewInvoice) -> sqlx::Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO invoices (
                id,
                organization_id,
                stripe_invoice_id,
                stripe_subscription_id,
                amount_due,
                amount_paid,
                currency,
                status,
                hosted_invoice_url,
                invoice_pdf,
                period_start,
                period_end,
                paid_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (stripe_invoice_id, status) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(invoice.organization_id)
        .bind(&invoice.stripe_invoice_id)
        .bind(&invoice.stripe_subscription_id)
        .bind(invoice.amount_due)
        .bind(invoice.amount_paid)
        .bind(&invoice.currency)
        .bind(invoice.status.as_str())
        .bind(&invoice.hosted_invoice_url)
        .bind(&invoice.invoice_pdf)
        .bind(invoice.period_start)
        .bind(invoice.period_end)
        .bind(invoice.paid_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn recent_invoices(
        &self,
        organization_id: i32,
        limit: i64,
    ) -> sqlx::Result<Vec<Invoice>> {
        let rows = sqlx::query_as::<_, InvoiceRow>(
            "SELECT * FROM invoices WHERE organization_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(organization_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Invoice::from).collect())
    }

    async fn count_phone_numbers(
        &self,
        organization_id: i32,
        kind: Option<PhoneNumberKind>,
    ) -> sqlx::Result<i64> {
        sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM phone_numbers
            WHERE organization_id = $1
              AND status = 'active'
              AND ($2::TEXT IS NULL OR kind = $2)
            "#,
        )
        .bind(organization_id)
        .bind(kind.map(|kind| kind.as_str()))
        .fetch_one(&self.pool)
        .await
    }

    async fn count_outbound_sms(
        &self,
        organization_id: i32,
        period: &BillingPeriod,
    ) -> sqlx::Result<i64> {
        sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM sms_messages m
            JOIN phone_numbers p ON p.id = m.phone_number_id
            WHERE p.organization_id = $1
              AND m.direction = 'outbound'
              AND m.sent_at >= $2
              AND m.sent_at < $3
            "#,
        )
        .bind(organization_id)
        .bind(period.start)
        .bind(period.end)
        .fetch_one(&self.pool)
        .await
    }

    async fn count_extensions(&self, organization_id: i32) -> sqlx::Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM extensions WHERE organization_id = $1")
            .bind(organization_id)
            .fetch_one(&self.pool)
            .await
    }

    async fn insert_usage_record(&self, record: &UsageRecord) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_records (
                id,
                organization_id,
                subscription_id,
                usage_type,
                quantity,
                unit_price,
                total_price,
                billing_period_start,
                billing_period_end,
                description,
                created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.id)
        .bind(record.organization_id)
        .bind(record.subscription_id)
        .bind(record.usage_type.as_str())
        .bind(record.quantity)
        .bind(record.unit_price)
        .bind(record.total_price)
        .bind(record.billing_period_start)
        .bind(record.billing_period_end)
        .bind(&record.description)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sum_usage(
        &self,
        organization_id: i32,
        usage_type: UsageType,
        period: &BillingPeriod,
    ) -> sqlx::Result<i64> {
        sqlx::query_scalar(
            r#"
            SELECT LEAST(COALESCE(SUM(quantity), 0), 9223372036854775807)::BIGINT
            FROM usage_records
            WHERE organization_id = $1
              AND usage_type = $2
              AND created_at >= $3
              AND created_at < $4
            "#,
        )
        .bind(organization_id)
        .bind(usage_type.as_str())
        .bind(period.start)
        .bind(period.end)
        .fetch_one(&self.pool)
        .await
    }

    async fn is_event_processed(&self, event_id: &str) -> sqlx::Result<bool> {
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM webhook_events WHERE event_id = $1)")
            .bind(event_id)
            .fetch_one(&self.pool)
            .await
    }

    async fn mark_event_processed(&self, event_id: &str, event_type: &str) -> sqlx::Result<()> {
        sqlx::query(
            "INSERT INTO webhook_events (event_id, event_type) VALUES ($1, $2) \
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(event_id)
        .bind(event_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
