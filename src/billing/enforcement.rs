//! Decision functions consulted before a tenant performs a metered action.
//!
//! Phone numbers and extensions are hard caps: the request is refused outright. SMS is a
//! soft cap: sending is always allowed and overage accrues once the budget is spent.

use serde::{Deserialize, Serialize};

use super::catalog::{get_tier_limits, is_unlimited, AiReceptionistTier, Feature, UNLIMITED};

const PROFESSIONAL_AI_FEATURES: [&str; 3] =
    ["call_summaries", "sentiment_analysis", "custom_greetings"];
const ENTERPRISE_AI_FEATURES: [&str; 3] = [
    "custom_ai_training",
    "multilingual_receptionist",
    "advanced_call_routing",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub max_allowed: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SmsDecision {
    pub allowed: bool,
    pub remaining: i64,
    pub will_incur_overage: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiFeatureDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier_required: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiAccessDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Resource a caller wants to consume, as accepted by the entitlement endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "resource", rename_all = "snake_case")]
pub enum EntitlementCheck {
    PhoneNumber,
    Extension,
    Sms,
    AiFeature { feature: String },
    Api,
}

/// Any of the decisions above, serialized untagged so the caller sees the decision's own shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum EntitlementDecision {
    Cap(CapDecision),
    Sms(SmsDecision),
    AiFeature(AiFeatureDecision),
    Api(ApiAccessDecision),
}

impl EntitlementDecision {
    pub fn allowed(&self) -> bool {
        match self {
            EntitlementDecision::Cap(decision) => decision.allowed,
            EntitlementDecision::Sms(decision) => decision.allowed,
            EntitlementDecision::AiFeature(decision) => decision.allowed,
            EntitlementDecision::Api(decision) => decision.allowed,
        }
    }
}

pub fn can_add_phone_number(plan_key: &str, current_count: i64) -> CapDecision {
    let tier = get_tier_limits(plan_key);
    let limit = tier.max_phone_numbers;
    if is_unlimited(limit) || current_count < limit {
        return CapDecision {
            allowed: true,
            reason: None,
            max_allowed: limit,
        };
    }
    CapDecision {
        allowed: false,
        reason: Some(format!(
            "Your {} plan allows up to {} phone number{}. Upgrade your plan to add more.",
            tier.name,
            limit,
            if limit == 1 { "" } else { "s" }
        )),
        max_allowed: limit,
    }
}

pub fn check_extension_limit(plan_key: &str, current_count: i64) -> CapDecision {
    let tier = get_tier_limits(plan_key);
    let limit = tier.max_extensions;
    if is_unlimited(limit) {
        return CapDecision {
            allowed: true,
            reason: None,
            max_allowed: UNLIMITED,
        };
    }
    if current_count < limit {
        return CapDecision {
            allowed: true,
            reason: None,
            max_allowed: limit,
        };
    }
    CapDecision {
        allowed: false,
        reason: Some(format!(
            "Your {} plan allows up to {} extensions. Upgrade your plan to add more.",
            tier.name, limit
        )),
        max_allowed: limit,
    }
}

pub fn can_send_sms(plan_key: &str, current_month_count: i64) -> SmsDecision {
    let budget = get_tier_limits(plan_key).monthly_sms_budget;
    if is_unlimited(budget) {
        return SmsDecision {
            allowed: true,
            remaining: UNLIMITED,
            will_incur_overage: false,
        };
    }
    SmsDecision {
        allowed: true,
        remaining: (budget - current_month_count).max(0),
        will_incur_overage: current_month_count >= budget,
    }
}

pub fn can_use_ai_feature(plan_key: &str, feature_name: &str) -> AiFeatureDecision {
    let tier = get_tier_limits(plan_key);
    let current = tier.ai_receptionist_tier;

    let required = if ENTERPRISE_AI_FEATURES.contains(&feature_name) {
        Some((AiReceptionistTier::Premium, "enterprise"))
    } else if PROFESSIONAL_AI_FEATURES.contains(&feature_name) {
        Some((AiReceptionistTier::Advanced, "professional"))
    } else {
        None
    };

    match required {
        Some((minimum, plan)) if current < minimum => AiFeatureDecision {
            allowed: false,
            reason: Some(format!(
                "The {} AI feature is not included in your {} plan. Upgrade to {} to use it.",
                feature_name,
                tier.name,
                if plan == "enterprise" { "Enterprise" } else { "Professional or above" }
            )),
            tier_required: Some(plan.to_string()),
        },
        _ => AiFeatureDecision {
            allowed: true,
            reason: None,
            tier_required: None,
        },
    }
}

pub fn can_access_api(plan_key: &str) -> ApiAccessDecision {
    let tier = get_tier_limits(plan_key);
    if tier.features.get(Feature::ApiAccess) {
        ApiAccessDecision {
            allowed: true,
            reason: None,
        }
    } else {
        ApiAccessDecision {
            allowed: false,
            reason: Some(format!(
                "API access is not available on the {} plan. Upgrade to Professional or above.",
                tier.name
            )),
        }
    }
}
