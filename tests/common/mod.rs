#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::Receiver;

use switchboard_billing::billing::events::{sign_payload, WebhookEvent};
use switchboard_billing::billing::processor::{
    CardDetails, CheckoutRequest, CheckoutSession, CreatedSubscription, NewCustomer,
    NewSubscription, PaymentMethod, PortalSession, PriceRef, ProcessorCustomer, ProcessorError,
    ProcessorInvoice, ProcessorSubscription, SubscriptionItem, SubscriptionItems,
};
use switchboard_billing::billing::{
    notification_channel, BillingService, BillingSettings, BillingTimeouts, InMemoryBillingStore,
    Notice, PaymentProcessor, PlanKey, WebhookProcessor, WebhookSettings,
};
use switchboard_billing::config::PlanPriceIds;

pub const WEBHOOK_SECRET: &str = "whsec_integration";

pub fn prices() -> PlanPriceIds {
    PlanPriceIds {
        starter: Some("price_starter".into()),
        professional: Some("price_professional".into()),
        enterprise: Some("price_enterprise".into()),
    }
}

pub fn quick_timeouts() -> BillingTimeouts {
    BillingTimeouts {
        processor: Duration::from_millis(50),
        store: Duration::from_secs(1),
    }
}

#[derive(Default)]
struct FakeState {
    next_id: u32,
    customers: Vec<ProcessorCustomer>,
    subscriptions: HashMap<String, ProcessorSubscription>,
    payment_methods: Vec<PaymentMethod>,
    default_payment_method: Option<String>,
    upcoming: Option<ProcessorInvoice>,
    created_subscriptions: Vec<(String, String, u32)>,
    checkout_sessions: Vec<(String, String)>,
}

/// In-process stand-in for the payment processor.
#[derive(Default)]
pub struct FakeProcessor {
    state: Mutex<FakeState>,
    delay: Option<Duration>,
    fail: bool,
}

impl FakeProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `delay` first.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Every call fails with a 503.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn put_subscription(&self, subscription: ProcessorSubscription) {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    pub fn subscription(&self, id: &str) -> Option<ProcessorSubscription> {
        self.state.lock().unwrap().subscriptions.get(id).cloned()
    }

    pub fn put_card(&self, id: &str, last4: &str) {
        self.state.lock().unwrap().payment_methods.push(card(id, last4));
    }

    pub fn put_upcoming(&self, invoice: ProcessorInvoice) {
        self.state.lock().unwrap().upcoming = Some(invoice);
    }

    pub fn customers(&self) -> Vec<ProcessorCustomer> {
        self.state.lock().unwrap().customers.clone()
    }

    pub fn default_payment_method(&self) -> Option<String> {
        self.state.lock().unwrap().default_payment_method.clone()
    }

    pub fn created_subscriptions(&self) -> Vec<(String, String, u32)> {
        self.state.lock().unwrap().created_subscriptions.clone()
    }

    pub fn checkout_sessions(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().checkout_sessions.clone()
    }

    async fn pause(&self) -> Result<(), ProcessorError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(ProcessorError::Api {
                status: 503,
                message: "processor unavailable".into(),
            });
        }
        Ok(())
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        format!("{prefix}_{}", state.next_id)
    }

    fn missing(what: &str) -> ProcessorError {
        ProcessorError::Api {
            status: 404,
            message: format!("No such {what}"),
        }
    }
}

#[async_trait]
impl PaymentProcessor for FakeProcessor {
    async fn create_customer(
        &self,
        customer: &NewCustomer<'_>,
    ) -> Result<ProcessorCustomer, ProcessorError> {
        self.pause().await?;
        let created = ProcessorCustomer {
            id: self.next_id("cus"),
            email: customer.email.map(str::to_string),
            name: Some(customer.name.to_string()),
        };
        self.state.lock().unwrap().customers.push(created.clone());
        Ok(created)
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<ProcessorSubscription, ProcessorError> {
        self.pause().await?;
        self.subscription(subscription_id)
            .ok_or_else(|| Self::missing("subscription"))
    }

    async fn create_subscription(
        &self,
        request: &NewSubscription<'_>,
    ) -> Result<CreatedSubscription, ProcessorError> {
        self.pause().await?;
        let id = self.next_id("sub");
        let mut created = processor_subscription(
            &id,
            request.customer_id,
            "trialing",
            request.organization_id,
            request.price_id,
        );
        created
            .metadata
            .insert("plan_id".into(), request.plan.as_str().into());
        self.put_subscription(created.clone());
        self.state.lock().unwrap().created_subscriptions.push((
            request.customer_id.to_string(),
            request.price_id.to_string(),
            request.trial_days,
        ));
        Ok(CreatedSubscription {
            subscription: created,
            client_secret: Some(format!("pi_{id}_secret")),
        })
    }

    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        item_id: &str,
        price_id: &str,
        plan: PlanKey,
    ) -> Result<ProcessorSubscription, ProcessorError> {
        self.pause().await?;
        let mut state = self.state.lock().unwrap();
        let subscription = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| Self::missing("subscription"))?;
        for item in subscription.items.data.iter_mut() {
            if item.id == item_id {
                item.price.id = price_id.to_string();
            }
        }
        subscription
            .metadata
            .insert("plan_id".into(), plan.as_str().into());
        Ok(subscription.clone())
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> Result<ProcessorSubscription, ProcessorError> {
        self.pause().await?;
        let mut state = self.state.lock().unwrap();
        let subscription = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| Self::missing("subscription"))?;
        subscription.cancel_at_period_end = cancel;
        Ok(subscription.clone())
    }

    async fn list_payment_methods(
        &self,
        _customer_id: &str,
    ) -> Result<Vec<PaymentMethod>, ProcessorError> {
        self.pause().await?;
        Ok(self.state.lock().unwrap().payment_methods.clone())
    }

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        _customer_id: &str,
    ) -> Result<PaymentMethod, ProcessorError> {
        self.pause().await?;
        let method = card(payment_method_id, "4242");
        self.state.lock().unwrap().payment_methods.push(method.clone());
        Ok(method)
    }

    async fn set_default_payment_method(
        &self,
        _customer_id: &str,
        payment_method_id: &str,
    ) -> Result<(), ProcessorError> {
        self.pause().await?;
        self.state.lock().unwrap().default_payment_method = Some(payment_method_id.to_string());
        Ok(())
    }

    async fn upcoming_invoice(
        &self,
        _customer_id: &str,
    ) -> Result<Option<ProcessorInvoice>, ProcessorError> {
        self.pause().await?;
        Ok(self.state.lock().unwrap().upcoming.clone())
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest<'_>,
    ) -> Result<CheckoutSession, ProcessorError> {
        self.pause().await?;
        let id = self.next_id("cs");
        self.state
            .lock()
            .unwrap()
            .checkout_sessions
            .push((request.customer_id.to_string(), request.price_id.to_string()));
        Ok(CheckoutSession {
            url: Some(format!("https://checkout.example/{id}")),
            id,
        })
    }

    async fn create_billing_portal_session(
        &self,
        customer_id: &str,
        _return_url: &str,
    ) -> Result<PortalSession, ProcessorError> {
        self.pause().await?;
        Ok(PortalSession {
            id: self.next_id("bps"),
            url: format!("https://portal.example/{customer_id}"),
        })
    }
}

pub fn card(id: &str, last4: &str) -> PaymentMethod {
    PaymentMethod {
        id: id.to_string(),
        card: Some(CardDetails {
            brand: "visa".into(),
            last4: last4.to_string(),
            exp_month: Some(12),
            exp_year: Some(2030),
        }),
    }
}

pub fn processor_subscription(
    id: &str,
    customer: &str,
    status: &str,
    organization_id: i32,
    price_id: &str,
) -> ProcessorSubscription {
    ProcessorSubscription {
        id: id.to_string(),
        customer: customer.to_string(),
        status: status.to_string(),
        items: SubscriptionItems {
            data: vec![SubscriptionItem {
                id: format!("si_{id}"),
                price: PriceRef {
                    id: price_id.to_string(),
                },
            }],
        },
        metadata: HashMap::from([("organization_id".to_string(), organization_id.to_string())]),
        current_period_start: Some(1_717_200_000),
        current_period_end: Some(1_719_792_000),
        cancel_at_period_end: false,
        trial_end: None,
        canceled_at: None,
    }
}

pub struct Harness {
    pub store: InMemoryBillingStore,
    pub processor: Arc<FakeProcessor>,
    pub service: BillingService,
    pub webhooks: WebhookProcessor,
    pub notices: Receiver<Notice>,
}

pub fn harness() -> Harness {
    harness_with(FakeProcessor::new(), BillingTimeouts::default())
}

pub fn harness_with(processor: FakeProcessor, timeouts: BillingTimeouts) -> Harness {
    let store = InMemoryBillingStore::new();
    let processor = Arc::new(processor);
    let (notifications, notices) = notification_channel(16);
    let service = BillingService::new(
        Arc::new(store.clone()),
        processor.clone(),
        BillingSettings {
            prices: prices(),
            timeouts,
            trial_days: 14,
        },
    );
    let webhooks = WebhookProcessor::new(
        Arc::new(store.clone()),
        processor.clone(),
        notifications,
        WebhookSettings {
            secret: WEBHOOK_SECRET.to_string(),
            prices: prices(),
            timeouts,
            payment_retry_days: 3,
            past_due_grace_days: 7,
        },
    );
    Harness {
        store,
        processor,
        service,
        webhooks,
        notices,
    }
}

pub fn event_payload(id: &str, event_type: &str, created: i64, object: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": id,
        "type": event_type,
        "created": created,
        "data": {"object": object},
    }))
    .unwrap()
}

pub fn signature_for(payload: &[u8]) -> String {
    sign_payload(payload, WEBHOOK_SECRET, Utc::now().timestamp())
}

/// Signs and verifies `object` as an event, the same path the HTTP handler takes.
pub fn verified_event(
    webhooks: &WebhookProcessor,
    id: &str,
    event_type: &str,
    created: DateTime<Utc>,
    object: Value,
) -> WebhookEvent {
    let payload = event_payload(id, event_type, created.timestamp(), object);
    webhooks
        .verify(&payload, &signature_for(&payload), Utc::now())
        .unwrap();
    webhooks.decode(&payload).unwrap()
}

pub fn subscription_object(
    id: &str,
    status: &str,
    organization_id: i32,
    price_id: &str,
) -> Value {
    serde_json::to_value(processor_subscription(
        id,
        "cus_test",
        status,
        organization_id,
        price_id,
    ))
    .unwrap()
}

pub fn invoice_object(id: &str, organization_id: i32, amount_due: i64, amount_paid: i64) -> Value {
    json!({
        "id": id,
        "customer": "cus_test",
        "subscription": "sub_test",
        "amount_due": amount_due,
        "amount_paid": amount_paid,
        "currency": "usd",
        "hosted_invoice_url": format!("https://invoice.example/{id}"),
        "invoice_pdf": format!("https://invoice.example/{id}.pdf"),
        "period_start": 1_717_200_000,
        "period_end": 1_719_792_000,
        "status_transitions": {"paid_at": 1_717_300_000},
        "subscription_details": {"metadata": {"organization_id": organization_id.to_string()}}
    })
}
