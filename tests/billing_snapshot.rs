mod common;

use chrono::{Duration, Utc};
use std::time::Duration as StdDuration;

use common::{harness, harness_with, processor_subscription, FakeProcessor, Harness};
use switchboard_billing::billing::models::{
    Organization, PhoneNumberKind, SubscriptionStatus, SubscriptionUpsert,
};
use switchboard_billing::billing::processor::ProcessorInvoice;
use switchboard_billing::billing::service::SubscriptionSource;
use switchboard_billing::billing::store::BillingStore;
use switchboard_billing::billing::{BillingAction, BillingError, BillingTimeouts};

/// Organization with a processor customer and one local subscription row on `plan`.
async fn subscribed(h: &Harness, plan: &str) -> Organization {
    let org = h.store.add_organization("acme", "Acme", plan).await;
    h.store.set_stripe_customer_id(org.id, "cus_acme").await.unwrap();
    let price = format!("price_{plan}");
    h.processor
        .put_subscription(processor_subscription("sub_acme", "cus_acme", "active", org.id, &price));
    h.store
        .upsert_subscription(&SubscriptionUpsert {
            organization_id: org.id,
            stripe_subscription_id: "sub_acme".into(),
            stripe_customer_id: "cus_acme".into(),
            stripe_price_id: Some(price),
            plan_id: plan.into(),
            status: SubscriptionStatus::Active,
            current_period_start: Some(Utc::now() - Duration::days(3)),
            current_period_end: Some(Utc::now() + Duration::days(27)),
            cancel_at_period_end: false,
            trial_ends_at: None,
            canceled_at: None,
            last_event_at: Utc::now(),
        })
        .await
        .unwrap();
    h.service.organization_for("acme").await.unwrap()
}

fn upcoming() -> ProcessorInvoice {
    serde_json::from_value(serde_json::json!({
        "customer": "cus_acme",
        "amount_due": 7900,
        "amount_paid": 0,
        "currency": "usd"
    }))
    .unwrap()
}

// key: billing-snapshot-tests -> read path

#[tokio::test]
async fn snapshot_without_subscription_falls_back_to_organization() {
    let h = harness();
    let org = h.store.add_organization("acme", "Acme", "starter").await;

    let snapshot = h.service.snapshot(&org, Utc::now()).await.unwrap();
    assert_eq!(snapshot.subscription.source, SubscriptionSource::Organization);
    assert_eq!(snapshot.subscription.plan_id, "starter");
    assert!(snapshot.live_subscription.is_none());
    assert!(snapshot.payment_methods.is_empty());
    assert!(snapshot.invoices.is_empty());
    assert!(snapshot.degraded.is_empty());
    assert_eq!(snapshot.plan.name, "Starter");
    assert_eq!(snapshot.charges.total, 2900);
}

#[tokio::test]
async fn snapshot_merges_local_and_processor_state() {
    let h = harness();
    let org = subscribed(&h, "professional").await;
    h.processor.put_card("pm_1", "4242");
    h.processor.put_upcoming(upcoming());
    for _ in 0..4 {
        h.store.add_phone_number(org.id, PhoneNumberKind::Local).await;
    }
    h.store.add_phone_number(org.id, PhoneNumberKind::TollFree).await;

    let snapshot = h.service.snapshot(&org, Utc::now()).await.unwrap();
    assert_eq!(snapshot.subscription.source, SubscriptionSource::Subscription);
    assert_eq!(snapshot.subscription.stripe_subscription_id.as_deref(), Some("sub_acme"));
    assert_eq!(
        snapshot.live_subscription.as_ref().map(|sub| sub.id.as_str()),
        Some("sub_acme")
    );
    assert_eq!(snapshot.payment_methods.len(), 1);
    assert_eq!(snapshot.upcoming_invoice.map(|invoice| invoice.amount_due), Some(7900));
    assert_eq!(snapshot.phone_numbers.total, 5);
    assert_eq!(snapshot.phone_numbers.toll_free, 1);
    assert_eq!(snapshot.usage.phone_numbers.used, 5);
    assert_eq!(snapshot.usage.phone_numbers.limit, 3);
    // Two numbers over the cap, one of them toll free.
    assert_eq!(snapshot.charges.base_plan, 7900);
    assert!(snapshot.charges.additional_phone_numbers > 0);
    assert!(snapshot.charges.toll_free_numbers > 0);
    assert_eq!(
        snapshot.charges.total,
        7900 + snapshot.charges.additional_phone_numbers + snapshot.charges.toll_free_numbers
    );
    assert!(snapshot.degraded.is_empty());
}

#[tokio::test]
async fn slow_processor_degrades_only_its_sections() {
    let timeouts = BillingTimeouts {
        processor: StdDuration::from_millis(20),
        store: StdDuration::from_secs(1),
    };
    let h = harness_with(FakeProcessor::slow(StdDuration::from_millis(200)), timeouts);
    let org = subscribed(&h, "starter").await;
    h.store.add_phone_number(org.id, PhoneNumberKind::Local).await;

    let snapshot = h.service.snapshot(&org, Utc::now()).await.unwrap();
    assert_eq!(
        snapshot.degraded,
        vec!["liveSubscription", "paymentMethods", "upcomingInvoice"]
    );
    assert!(snapshot.live_subscription.is_none());
    assert_eq!(snapshot.subscription.source, SubscriptionSource::Subscription);
    assert_eq!(snapshot.phone_numbers.total, 1);
}

#[tokio::test]
async fn failing_processor_still_returns_local_data() {
    let h = harness_with(FakeProcessor::failing(), BillingTimeouts::default());
    let org = h.store.add_organization("acme", "Acme", "starter").await;
    h.store.set_stripe_customer_id(org.id, "cus_acme").await.unwrap();
    let org = h.service.organization_for("acme").await.unwrap();

    let snapshot = h.service.snapshot(&org, Utc::now()).await.unwrap();
    // No local subscription row, so there is nothing live to fetch.
    assert_eq!(snapshot.degraded, vec!["paymentMethods", "upcomingInvoice"]);
    assert_eq!(snapshot.organization.stripe_customer_id.as_deref(), Some("cus_acme"));
}

// key: billing-actions-tests -> write path

#[tokio::test]
async fn create_customer_is_idempotent() {
    let h = harness();
    h.store.add_organization("acme", "Acme", "starter").await;

    let org = h.service.organization_for("acme").await.unwrap();
    let first = h.service.execute(&org, BillingAction::CreateCustomer).await.unwrap();
    let org = h.service.organization_for("acme").await.unwrap();
    let second = h.service.execute(&org, BillingAction::CreateCustomer).await.unwrap();

    assert!(first.success);
    assert_eq!(first.customer_id, second.customer_id);
    assert_eq!(second.message.as_deref(), Some("billing customer already exists"));
    assert_eq!(h.processor.customers().len(), 1);
    assert_eq!(h.processor.customers()[0].email.as_deref(), Some("billing@acme.example"));
}

#[tokio::test]
async fn actions_needing_a_customer_fail_precondition() {
    let h = harness();
    let org = h.store.add_organization("acme", "Acme", "starter").await;

    for action in [
        BillingAction::CreateSubscription {
            plan_id: "professional".into(),
        },
        BillingAction::UpdatePaymentMethod {
            payment_method_id: "pm_1".into(),
        },
        BillingAction::CreateBillingPortal {
            return_url: "https://app.example/billing".into(),
        },
    ] {
        let err = h.service.execute(&org, action).await.unwrap_err();
        assert!(matches!(err, BillingError::Precondition(_)), "got {err:?}");
    }
}

#[tokio::test]
async fn unknown_plan_is_rejected() {
    let h = harness();
    let org = subscribed(&h, "starter").await;
    let err = h
        .service
        .execute(
            &org,
            BillingAction::ChangePlan {
                plan_id: "platinum".into(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Catalog(_)));
}

#[tokio::test]
async fn create_subscription_returns_client_secret() {
    let h = harness();
    let org = h.store.add_organization("acme", "Acme", "starter").await;
    h.store.set_stripe_customer_id(org.id, "cus_acme").await.unwrap();
    let org = h.service.organization_for("acme").await.unwrap();

    let response = h
        .service
        .execute(
            &org,
            BillingAction::CreateSubscription {
                plan_id: "professional".into(),
            },
        )
        .await
        .unwrap();
    let subscription_id = response.subscription_id.unwrap();
    assert_eq!(response.client_secret, Some(format!("pi_{subscription_id}_secret")));
    assert_eq!(
        h.processor.created_subscriptions(),
        vec![("cus_acme".to_string(), "price_professional".to_string(), 14)]
    );
    // Local rows only appear once the processor's webhook arrives.
    assert!(h.store.subscriptions().await.is_empty());
}

#[tokio::test]
async fn change_plan_without_subscription_is_not_found() {
    let h = harness();
    let org = h.store.add_organization("acme", "Acme", "starter").await;
    h.store.set_stripe_customer_id(org.id, "cus_acme").await.unwrap();
    let org = h.service.organization_for("acme").await.unwrap();

    let err = h
        .service
        .execute(
            &org,
            BillingAction::ChangePlan {
                plan_id: "enterprise".into(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NotFound("subscription")));
}

#[tokio::test]
async fn change_plan_swaps_the_subscription_price() {
    let h = harness();
    let org = subscribed(&h, "starter").await;

    let response = h
        .service
        .execute(
            &org,
            BillingAction::ChangePlan {
                plan_id: "enterprise".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(response.message.as_deref(), Some("plan changed to Enterprise"));
    let live = h.processor.subscription("sub_acme").unwrap();
    assert_eq!(live.price_id(), Some("price_enterprise"));
    assert_eq!(live.plan_metadata(), Some("enterprise"));
}

#[tokio::test]
async fn cancel_and_reactivate_toggle_period_end() {
    let h = harness();
    let org = subscribed(&h, "professional").await;

    let canceled = h
        .service
        .execute(&org, BillingAction::CancelSubscription)
        .await
        .unwrap();
    assert_eq!(canceled.subscription_id.as_deref(), Some("sub_acme"));
    assert!(h.processor.subscription("sub_acme").unwrap().cancel_at_period_end);

    let reactivated = h
        .service
        .execute(&org, BillingAction::ReactivateSubscription)
        .await
        .unwrap();
    assert_eq!(reactivated.message.as_deref(), Some("subscription reactivated"));
    assert!(!h.processor.subscription("sub_acme").unwrap().cancel_at_period_end);
}

#[tokio::test]
async fn update_payment_method_sets_default() {
    let h = harness();
    let org = subscribed(&h, "starter").await;
    h.service
        .execute(
            &org,
            BillingAction::UpdatePaymentMethod {
                payment_method_id: "pm_new".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(h.processor.default_payment_method().as_deref(), Some("pm_new"));
}

#[tokio::test]
async fn checkout_creates_customer_on_demand() {
    let h = harness();
    let org = h.store.add_organization("acme", "Acme", "starter").await;

    let response = h
        .service
        .execute(
            &org,
            BillingAction::CreateCheckoutSession {
                plan_id: "professional".into(),
                success_url: "https://app.example/ok".into(),
                cancel_url: "https://app.example/cancel".into(),
            },
        )
        .await
        .unwrap();
    let customer_id = response.customer_id.unwrap();
    assert!(response.url.unwrap().starts_with("https://checkout.example/"));
    assert_eq!(
        h.processor.checkout_sessions(),
        vec![(customer_id.clone(), "price_professional".to_string())]
    );
    let stored = h.store.organization(org.id).await.unwrap().unwrap();
    assert_eq!(stored.stripe_customer_id, Some(customer_id));
}

#[tokio::test]
async fn billing_portal_returns_session_url() {
    let h = harness();
    let org = subscribed(&h, "starter").await;
    let response = h
        .service
        .execute(
            &org,
            BillingAction::CreateBillingPortal {
                return_url: "https://app.example/billing".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(response.url.as_deref(), Some("https://portal.example/cus_acme"));
}

#[tokio::test]
async fn slow_processor_times_out_writes() {
    let timeouts = BillingTimeouts {
        processor: StdDuration::from_millis(20),
        store: StdDuration::from_secs(1),
    };
    let h = harness_with(FakeProcessor::slow(StdDuration::from_millis(200)), timeouts);
    let org = h.store.add_organization("acme", "Acme", "starter").await;

    let err = h
        .service
        .execute(&org, BillingAction::CreateCustomer)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Timeout(_)));
    let stored = h.store.organization(org.id).await.unwrap().unwrap();
    assert!(stored.stripe_customer_id.is_none());
}
