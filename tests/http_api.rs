mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tower::ServiceExt; // for `oneshot`

use common::{
    event_payload, harness, invoice_object, signature_for, subscription_object, Harness,
};
use switchboard_billing::app;

const JWT_SECRET: &str = "secret";

fn router(h: &Harness) -> Router {
    std::env::set_var("JWT_SECRET", JWT_SECRET);
    app(h.service.clone(), h.webhooks.clone())
}

fn token(org: &str) -> String {
    let claims = json!({"sub": 1, "org": org, "role": "owner", "exp": 9999999999u64});
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn authed(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token("acme")))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// key: http-api-tests -> webhook endpoint

#[tokio::test]
async fn webhook_without_signature_is_rejected() {
    let h = harness();
    let response = router(&h)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/webhooks/stripe")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn webhook_with_bad_signature_is_rejected() {
    let h = harness();
    let org = h.store.add_organization("acme", "Acme", "starter").await;
    let payload = event_payload(
        "evt_1",
        "customer.subscription.updated",
        Utc::now().timestamp(),
        subscription_object("sub_1", "active", org.id, "price_starter"),
    );
    let forged = format!("t={},v1={}", Utc::now().timestamp(), "0".repeat(64));

    let response = router(&h)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/webhooks/stripe")
                .header("stripe-signature", forged)
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(h.store.subscriptions().await.is_empty());
    assert!(h.store.processed_events().await.is_empty());
}

#[tokio::test]
async fn signed_webhook_is_acknowledged() {
    let h = harness();
    let org = h.store.add_organization("acme", "Acme", "starter").await;
    let payload = event_payload(
        "evt_1",
        "customer.subscription.updated",
        Utc::now().timestamp(),
        subscription_object("sub_1", "active", org.id, "price_starter"),
    );
    let signature = signature_for(&payload);

    let response = router(&h)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/webhooks/stripe")
                .header("stripe-signature", signature)
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"received": true}));
    assert_eq!(h.store.subscriptions().await.len(), 1);
}

fn signed_webhook(payload: Vec<u8>) -> Request<Body> {
    let signature = signature_for(&payload);
    Request::builder()
        .method("POST")
        .uri("/api/webhooks/stripe")
        .header("stripe-signature", signature)
        .body(Body::from(payload))
        .unwrap()
}

#[tokio::test]
async fn invoice_with_null_metadata_is_recorded() {
    let h = harness();
    let org = h.store.add_organization("acme", "Acme", "starter").await;
    let mut invoice = invoice_object("in_1", org.id, 2900, 2900);
    invoice["metadata"] = Value::Null;
    let payload = event_payload("evt_paid", "invoice.paid", Utc::now().timestamp(), invoice);

    let response = router(&h).oneshot(signed_webhook(payload)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.store.invoices().await.len(), 1);
}

#[tokio::test]
async fn invoice_without_tenant_metadata_is_acknowledged() {
    let h = harness();
    h.store.add_organization("acme", "Acme", "starter").await;
    let mut invoice = invoice_object("in_2", 1, 2900, 2900);
    invoice["subscription_details"] = json!({"metadata": null});
    let payload = event_payload("evt_null", "invoice.paid", Utc::now().timestamp(), invoice);

    let response = router(&h).oneshot(signed_webhook(payload)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"received": true}));
    assert!(h.store.invoices().await.is_empty());
    assert_eq!(h.store.processed_events().await, vec!["evt_null".to_string()]);
}

#[tokio::test]
async fn signed_but_undecodable_payload_is_acknowledged() {
    let h = harness();
    let payload = event_payload(
        "evt_bad",
        "invoice.paid",
        Utc::now().timestamp(),
        json!({"id": "in_3", "amount_due": "lots"}),
    );

    let response = router(&h).oneshot(signed_webhook(payload)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"received": true}));
    assert!(h.store.invoices().await.is_empty());
}

// key: http-api-tests -> tenant endpoints

#[tokio::test]
async fn billing_requires_a_token() {
    let h = harness();
    let response = router(&h)
        .oneshot(
            Request::builder()
                .uri("/api/billing")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn billing_snapshot_is_served_for_the_callers_organization() {
    let h = harness();
    h.store.add_organization("acme", "Acme", "professional").await;

    let response = router(&h)
        .oneshot(
            Request::builder()
                .uri("/api/billing")
                .header(header::COOKIE, format!("auth_token={}", token("acme")))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["organization"]["name"], "Acme");
    assert_eq!(body["plan"]["name"], "Professional");
    assert_eq!(body["subscription"]["source"], "organization");
    assert_eq!(body["charges"]["basePlan"], 7900);
}

#[tokio::test]
async fn unknown_organization_is_not_found() {
    let h = harness();
    let response = router(&h)
        .oneshot(authed("POST", "/api/billing", json!({"action": "createCustomer"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_action_is_a_bad_request() {
    let h = harness();
    h.store.add_organization("acme", "Acme", "starter").await;

    let response = router(&h)
        .oneshot(authed("POST", "/api/billing", json!({"action": "teleport"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("teleport"));
}

#[tokio::test]
async fn create_customer_action_returns_customer_id() {
    let h = harness();
    h.store.add_organization("acme", "Acme", "starter").await;

    let response = router(&h)
        .oneshot(authed("POST", "/api/billing", json!({"action": "createCustomer"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert!(body["customerId"].as_str().unwrap().starts_with("cus_"));
}

#[tokio::test]
async fn usage_is_recorded_with_created_status() {
    let h = harness();
    h.store.add_organization("acme", "Acme", "starter").await;

    let response = router(&h)
        .oneshot(authed(
            "POST",
            "/api/billing/usage",
            json!({"type": "sms_outbound", "quantity": 3}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;
    assert_eq!(body["record"]["quantity"], 3);
    assert_eq!(h.store.usage_records().await.len(), 1);
}

#[tokio::test]
async fn entitlement_check_returns_decision_shape() {
    let h = harness();
    h.store.add_organization("acme", "Acme", "starter").await;

    let response = router(&h)
        .oneshot(authed(
            "POST",
            "/api/billing/entitlements",
            json!({"resource": "sms"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body, json!({"allowed": true, "remaining": 500, "willIncurOverage": false}));
}
