use chrono::{DateTime, Datelike, Months, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::catalog::PlanKey;

/// key: billing-models -> organization (tenant)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: i32,
    pub external_id: String,
    pub name: String,
    /// Raw plan key. Entitlements resolve it leniently through [`Organization::plan_key`].
    pub plan: String,
    pub billing_status: Option<SubscriptionStatus>,
    pub stripe_customer_id: Option<String>,
    pub billing_email: Option<String>,
}

impl Organization {
    pub fn plan_key(&self) -> PlanKey {
        PlanKey::resolve(&self.plan)
    }
}

/// Local subscription vocabulary; processor statuses are mapped onto it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
    Incomplete,
    Trialing,
    Paused,
    Unknown,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Unknown => "unknown",
        }
    }

    /// Maps the payment processor's status vocabulary. Total: unmapped input is `Unknown`.
    pub fn from_processor(value: &str) -> Self {
        match value {
            "active" => SubscriptionStatus::Active,
            "past_due" | "unpaid" => SubscriptionStatus::PastDue,
            "canceled" | "incomplete_expired" => SubscriptionStatus::Canceled,
            "incomplete" => SubscriptionStatus::Incomplete,
            "trialing" => SubscriptionStatus::Trialing,
            "paused" => SubscriptionStatus::Paused,
            _ => SubscriptionStatus::Unknown,
        }
    }

    /// Parses a value previously written with [`SubscriptionStatus::as_str`].
    pub fn from_stored(value: &str) -> Self {
        match value {
            "active" => SubscriptionStatus::Active,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Canceled,
            "incomplete" => SubscriptionStatus::Incomplete,
            "trialing" => SubscriptionStatus::Trialing,
            "paused" => SubscriptionStatus::Paused,
            _ => SubscriptionStatus::Unknown,
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }
}

/// key: billing-subscription-model -> latest row per organization is authoritative
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub organization_id: i32,
    pub stripe_subscription_id: String,
    pub stripe_customer_id: String,
    pub stripe_price_id: Option<String>,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub last_event_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Every field a subscription webhook owns; written wholesale keyed by `stripe_subscription_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionUpsert {
    pub organization_id: i32,
    pub stripe_subscription_id: String,
    pub stripe_customer_id: String,
    pub stripe_price_id: Option<String>,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub last_event_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Paid,
    Failed,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Failed => "failed",
        }
    }

    pub fn from_stored(value: &str) -> Self {
        match value {
            "paid" => InvoiceStatus::Paid,
            _ => InvoiceStatus::Failed,
        }
    }
}

/// key: billing-invoice-model -> append-only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
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
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageType {
    AiMinutes,
    SmsOutbound,
    SmsInbound,
    CallRecording,
    InternationalMinutes,
}

impl UsageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageType::AiMinutes => "ai_minutes",
            UsageType::SmsOutbound => "sms_outbound",
            UsageType::SmsInbound => "sms_inbound",
            UsageType::CallRecording => "call_recording",
            UsageType::InternationalMinutes => "international_minutes",
        }
    }

    pub fn from_stored(value: &str) -> Option<Self> {
        match value {
            "ai_minutes" => Some(UsageType::AiMinutes),
            "sms_outbound" => Some(UsageType::SmsOutbound),
            "sms_inbound" => Some(UsageType::SmsInbound),
            "call_recording" => Some(UsageType::CallRecording),
            "international_minutes" => Some(UsageType::InternationalMinutes),
            _ => None,
        }
    }

    /// List price per unit in cents, used when the caller does not supply one.
    pub fn default_unit_price(&self) -> i64 {
        match self {
            UsageType::AiMinutes => 5,
            UsageType::SmsOutbound => 2,
            UsageType::SmsInbound => 1,
            UsageType::CallRecording => 1,
            UsageType::InternationalMinutes => 10,
        }
    }
}

/// Largest quantity a single usage entry may carry.
pub const MAX_USAGE_QUANTITY: i64 = 1_000_000;
/// Largest per-unit price, in cents, a single usage entry may carry.
pub const MAX_USAGE_UNIT_PRICE: i64 = 100_000;

/// key: billing-usage-ledger -> immutable usage entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub organization_id: i32,
    pub subscription_id: Option<Uuid>,
    pub usage_type: UsageType,
    pub quantity: i64,
    pub unit_price: i64,
    pub total_price: i64,
    pub billing_period_start: DateTime<Utc>,
    pub billing_period_end: DateTime<Utc>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UsageRecord {
    /// Builds a ledger entry; `total_price` is fixed here and never recomputed. Returns `None`
    /// when `quantity * unit_price` does not fit in an `i64`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        organization_id: i32,
        subscription_id: Option<Uuid>,
        usage_type: UsageType,
        quantity: i64,
        unit_price: i64,
        period: &BillingPeriod,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let total_price = quantity.checked_mul(unit_price)?;
        Some(Self {
            id: Uuid::new_v4(),
            organization_id,
            subscription_id,
            usage_type,
            quantity,
            unit_price,
            total_price,
            billing_period_start: period.start,
            billing_period_end: period.end,
            description,
            created_at: now,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhoneNumberKind {
    Local,
    TollFree,
}

impl PhoneNumberKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhoneNumberKind::Local => "local",
            PhoneNumberKind::TollFree => "toll_free",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhoneNumberInventory {
    pub total: i64,
    pub local: i64,
    pub toll_free: i64,
}

/// Calendar-month usage window. `end` is exclusive (first instant of the next month).
///
/// Months are cut in UTC for every tenant. Organizations carry no reporting time zone, so a
/// tenant's "local" month is the UTC month until one is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BillingPeriod {
    pub fn containing(now: DateTime<Utc>) -> Self {
        let start = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| Utc.from_utc_datetime(&naive))
            .unwrap_or(now);
        let end = start.checked_add_months(Months::new(1)).unwrap_or(start);
        Self { start, end }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageMeter {
    pub used: i64,
    pub limit: i64,
}

/// key: billing-usage-summary -> request-scoped, never cached
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSummary {
    pub period: BillingPeriod,
    pub phone_numbers: UsageMeter,
    pub sms: UsageMeter,
    pub ai_minutes: UsageMeter,
    pub extensions: UsageMeter,
    pub overage_charges: i64,
}
