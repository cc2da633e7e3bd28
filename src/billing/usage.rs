use chrono::{DateTime, Utc};

use super::catalog::{PlanKey, UNLIMITED};
use super::models::{
    BillingPeriod, PhoneNumberInventory, PhoneNumberKind, UsageMeter, UsageSummary, UsageType,
};
use super::overage::calculate_overage_charges;
use super::store::BillingStore;

/// Active phone numbers owned right now. Inventory, not a monthly rate.
pub async fn count_phone_numbers(
    store: &dyn BillingStore,
    organization_id: i32,
) -> sqlx::Result<i64> {
    store.count_phone_numbers(organization_id, None).await
}

/// Outbound messages sent from the organization's numbers during the calendar month of `now`.
pub async fn count_monthly_sms(
    store: &dyn BillingStore,
    organization_id: i32,
    now: DateTime<Utc>,
) -> sqlx::Result<i64> {
    let period = BillingPeriod::containing(now);
    store.count_outbound_sms(organization_id, &period).await
}

pub async fn count_monthly_ai_minutes(
    store: &dyn BillingStore,
    organization_id: i32,
    now: DateTime<Utc>,
) -> sqlx::Result<i64> {
    let period = BillingPeriod::containing(now);
    store
        .sum_usage(organization_id, UsageType::AiMinutes, &period)
        .await
}

pub async fn count_extensions(store: &dyn BillingStore, organization_id: i32) -> sqlx::Result<i64> {
    store.count_extensions(organization_id).await
}

pub async fn phone_number_inventory(
    store: &dyn BillingStore,
    organization_id: i32,
) -> sqlx::Result<PhoneNumberInventory> {
    let (total, local, toll_free) = tokio::try_join!(
        store.count_phone_numbers(organization_id, None),
        store.count_phone_numbers(organization_id, Some(PhoneNumberKind::Local)),
        store.count_phone_numbers(organization_id, Some(PhoneNumberKind::TollFree)),
    )?;
    Ok(PhoneNumberInventory {
        total,
        local,
        toll_free,
    })
}

/// key: billing-usage-summary -> used/limit per metered resource plus overage
pub async fn usage_summary(
    store: &dyn BillingStore,
    plan: PlanKey,
    organization_id: i32,
    now: DateTime<Utc>,
) -> sqlx::Result<UsageSummary> {
    let tier = plan.definition();
    let (phone_numbers, sms, ai_minutes, extensions) = tokio::try_join!(
        count_phone_numbers(store, organization_id),
        count_monthly_sms(store, organization_id, now),
        count_monthly_ai_minutes(store, organization_id, now),
        count_extensions(store, organization_id),
    )?;

    Ok(UsageSummary {
        period: BillingPeriod::containing(now),
        phone_numbers: UsageMeter {
            used: phone_numbers,
            limit: tier.max_phone_numbers,
        },
        sms: UsageMeter {
            used: sms,
            limit: tier.monthly_sms_budget,
        },
        ai_minutes: UsageMeter {
            used: ai_minutes,
            limit: tier.ai_minutes_included,
        },
        extensions: UsageMeter {
            used: extensions,
            limit: tier.max_extensions,
        },
        overage_charges: calculate_overage_charges(plan.as_str(), sms, ai_minutes),
    })
}

/// Remaining headroom for a meter, `-1` when the limit never binds.
pub fn remaining(meter: &UsageMeter) -> i64 {
    if meter.limit == UNLIMITED {
        UNLIMITED
    } else {
        (meter.limit - meter.used).max(0)
    }
}
