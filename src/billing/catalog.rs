use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Sentinel for numeric limits that never bind.
pub const UNLIMITED: i64 = -1;

/// key: billing-catalog -> overage and add-on unit prices (cents)
pub const SMS_OVERAGE_CENTS: i64 = 2;
pub const AI_MINUTE_OVERAGE_CENTS: i64 = 5;
pub const ADDITIONAL_PHONE_NUMBER_CENTS: i64 = 500;
pub const TOLL_FREE_NUMBER_CENTS: i64 = 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("unknown plan `{0}`")]
    UnknownPlan(String),
    #[error("unknown feature `{0}`")]
    UnknownFeature(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKey {
    Starter,
    Professional,
    Enterprise,
}

impl PlanKey {
    pub const ALL: [PlanKey; 3] = [PlanKey::Starter, PlanKey::Professional, PlanKey::Enterprise];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanKey::Starter => "starter",
            PlanKey::Professional => "professional",
            PlanKey::Enterprise => "enterprise",
        }
    }

    /// Lenient lookup used for entitlement decisions; anything unrecognised is Starter.
    pub fn resolve(value: &str) -> Self {
        value.parse().unwrap_or(PlanKey::Starter)
    }
}

impl FromStr for PlanKey {
    type Err = CatalogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "starter" => Ok(PlanKey::Starter),
            "professional" => Ok(PlanKey::Professional),
            "enterprise" => Ok(PlanKey::Enterprise),
            _ => Err(CatalogError::UnknownPlan(value.to_string())),
        }
    }
}

impl fmt::Display for PlanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiReceptionistTier {
    Basic,
    Advanced,
    Premium,
}

impl AiReceptionistTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiReceptionistTier::Basic => "basic",
            AiReceptionistTier::Advanced => "advanced",
            AiReceptionistTier::Premium => "premium",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    CallRecording,
    VoicemailTranscription,
    ApiAccess,
    AdvancedAnalytics,
    CustomIntegrations,
    PrioritySupport,
    Sso,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::CallRecording => "call_recording",
            Feature::VoicemailTranscription => "voicemail_transcription",
            Feature::ApiAccess => "api_access",
            Feature::AdvancedAnalytics => "advanced_analytics",
            Feature::CustomIntegrations => "custom_integrations",
            Feature::PrioritySupport => "priority_support",
            Feature::Sso => "sso",
        }
    }
}

impl FromStr for Feature {
    type Err = CatalogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "call_recording" => Ok(Feature::CallRecording),
            "voicemail_transcription" => Ok(Feature::VoicemailTranscription),
            "api_access" => Ok(Feature::ApiAccess),
            "advanced_analytics" => Ok(Feature::AdvancedAnalytics),
            "custom_integrations" => Ok(Feature::CustomIntegrations),
            "priority_support" => Ok(Feature::PrioritySupport),
            "sso" => Ok(Feature::Sso),
            _ => Err(CatalogError::UnknownFeature(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeatureFlags {
    pub call_recording: bool,
    pub voicemail_transcription: bool,
    pub api_access: bool,
    pub advanced_analytics: bool,
    pub custom_integrations: bool,
    pub priority_support: bool,
    pub sso: bool,
}

impl FeatureFlags {
    pub fn get(&self, feature: Feature) -> bool {
        match feature {
            Feature::CallRecording => self.call_recording,
            Feature::VoicemailTranscription => self.voicemail_transcription,
            Feature::ApiAccess => self.api_access,
            Feature::AdvancedAnalytics => self.advanced_analytics,
            Feature::CustomIntegrations => self.custom_integrations,
            Feature::PrioritySupport => self.priority_support,
            Feature::Sso => self.sso,
        }
    }
}

/// key: billing-catalog -> static tier definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierDefinition {
    pub plan: PlanKey,
    pub name: &'static str,
    pub description: &'static str,
    pub monthly_price: i64,
    pub max_phone_numbers: i64,
    pub monthly_sms_budget: i64,
    pub ai_receptionist_tier: AiReceptionistTier,
    pub ai_minutes_included: i64,
    pub max_extensions: i64,
    pub features: FeatureFlags,
}

static STARTER: TierDefinition = TierDefinition {
    plan: PlanKey::Starter,
    name: "Starter",
    description: "One business line with an AI receptionist for solo operators",
    monthly_price: 2900,
    max_phone_numbers: 1,
    monthly_sms_budget: 500,
    ai_receptionist_tier: AiReceptionistTier::Basic,
    ai_minutes_included: 100,
    max_extensions: 5,
    features: FeatureFlags {
        call_recording: false,
        voicemail_transcription: true,
        api_access: false,
        advanced_analytics: false,
        custom_integrations: false,
        priority_support: false,
        sso: false,
    },
};

static PROFESSIONAL: TierDefinition = TierDefinition {
    plan: PlanKey::Professional,
    name: "Professional",
    description: "Multiple lines, call recording and API access for growing teams",
    monthly_price: 7900,
    max_phone_numbers: 3,
    monthly_sms_budget: 2000,
    ai_receptionist_tier: AiReceptionistTier::Advanced,
    ai_minutes_included: 500,
    max_extensions: 25,
    features: FeatureFlags {
        call_recording: true,
        voicemail_transcription: true,
        api_access: true,
        advanced_analytics: true,
        custom_integrations: false,
        priority_support: false,
        sso: false,
    },
};

static ENTERPRISE: TierDefinition = TierDefinition {
    plan: PlanKey::Enterprise,
    name: "Enterprise",
    description: "Unlimited lines, messaging and AI minutes with premium support",
    monthly_price: 19900,
    max_phone_numbers: UNLIMITED,
    monthly_sms_budget: UNLIMITED,
    ai_receptionist_tier: AiReceptionistTier::Premium,
    ai_minutes_included: UNLIMITED,
    max_extensions: UNLIMITED,
    features: FeatureFlags {
        call_recording: true,
        voicemail_transcription: true,
        api_access: true,
        advanced_analytics: true,
        custom_integrations: true,
        priority_support: true,
        sso: true,
    },
};

impl PlanKey {
    pub fn definition(&self) -> &'static TierDefinition {
        match self {
            PlanKey::Starter => &STARTER,
            PlanKey::Professional => &PROFESSIONAL,
            PlanKey::Enterprise => &ENTERPRISE,
        }
    }
}

/// Total lookup: unknown or empty plan keys resolve to Starter.
pub fn get_tier_limits(plan_key: &str) -> &'static TierDefinition {
    PlanKey::resolve(plan_key).definition()
}

pub fn has_feature(plan_key: &str, feature: Feature) -> bool {
    get_tier_limits(plan_key).features.get(feature)
}

/// Wire-facing variant of [`has_feature`]; an unrecognised feature name is an error, never `true`.
pub fn has_named_feature(plan_key: &str, feature_name: &str) -> Result<bool, CatalogError> {
    let feature = feature_name.parse::<Feature>()?;
    Ok(has_feature(plan_key, feature))
}

pub fn catalog() -> [&'static TierDefinition; 3] {
    [&STARTER, &PROFESSIONAL, &ENTERPRISE]
}

pub fn is_unlimited(limit: i64) -> bool {
    limit == UNLIMITED
}
