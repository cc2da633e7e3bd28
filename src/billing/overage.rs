use serde::Serialize;

use super::catalog::{
    get_tier_limits, is_unlimited, PlanKey, ADDITIONAL_PHONE_NUMBER_CENTS,
    AI_MINUTE_OVERAGE_CENTS, SMS_OVERAGE_CENTS, TOLL_FREE_NUMBER_CENTS,
};
use super::models::{PhoneNumberInventory, UsageSummary};

/// Extra charge in cents for SMS and AI minutes beyond the plan allowance. Never negative.
pub fn calculate_overage_charges(plan_key: &str, sms_used: i64, ai_minutes_used: i64) -> i64 {
    let tier = get_tier_limits(plan_key);
    metered_overage(sms_used, tier.monthly_sms_budget, SMS_OVERAGE_CENTS)
        .saturating_add(metered_overage(
            ai_minutes_used,
            tier.ai_minutes_included,
            AI_MINUTE_OVERAGE_CENTS,
        ))
}

fn metered_overage(used: i64, allowance: i64, unit_price: i64) -> i64 {
    if is_unlimited(allowance) || used <= allowance {
        return 0;
    }
    used.saturating_sub(allowance).saturating_mul(unit_price)
}

/// key: billing-charges -> projected monthly charges shown on the dashboard (cents)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeBreakdown {
    pub base_plan: i64,
    pub additional_phone_numbers: i64,
    pub toll_free_numbers: i64,
    pub usage_overage: i64,
    pub total: i64,
}

impl ChargeBreakdown {
    pub fn compute(plan: PlanKey, inventory: &PhoneNumberInventory, usage: &UsageSummary) -> Self {
        let tier = plan.definition();
        let extra_numbers = if is_unlimited(tier.max_phone_numbers) {
            0
        } else {
            (inventory.total - tier.max_phone_numbers).max(0)
        };
        let base_plan = tier.monthly_price;
        let additional_phone_numbers = extra_numbers.saturating_mul(ADDITIONAL_PHONE_NUMBER_CENTS);
        let toll_free_numbers = inventory.toll_free.max(0).saturating_mul(TOLL_FREE_NUMBER_CENTS);
        let usage_overage = usage.overage_charges;
        Self {
            base_plan,
            additional_phone_numbers,
            toll_free_numbers,
            usage_overage,
            total: base_plan
                .saturating_add(additional_phone_numbers)
                .saturating_add(toll_free_numbers)
                .saturating_add(usage_overage),
        }
    }
}
