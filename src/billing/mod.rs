pub mod api;
pub mod catalog;
pub mod enforcement;
pub mod error;
pub mod events;
pub mod memory;
pub mod models;
pub mod notifications;
pub mod overage;
pub mod processor;
pub mod service;
pub mod store;
pub mod usage;
pub mod webhook;

pub use api::{check_entitlement, get_billing, post_billing_action, record_usage, stripe_webhook};
pub use catalog::{get_tier_limits, has_feature, PlanKey, TierDefinition, UNLIMITED};
pub use enforcement::{
    can_access_api, can_add_phone_number, can_send_sms, can_use_ai_feature,
    check_extension_limit, EntitlementCheck, EntitlementDecision,
};
pub use error::{BillingError, BillingTimeouts};
pub use memory::InMemoryBillingStore;
pub use notifications::{
    notification_channel, start_notification_worker, HttpNotifier, LogNotifier,
    NotificationHandle, Notice, Notifier,
};
pub use overage::{calculate_overage_charges, ChargeBreakdown};
pub use processor::{PaymentProcessor, ProcessorError, StripeClient};
pub use service::{BillingAction, BillingService, BillingSettings, BillingSnapshot};
pub use store::{BillingStore, PgBillingStore};
pub use webhook::{WebhookOutcome, WebhookProcessor, WebhookSettings};
