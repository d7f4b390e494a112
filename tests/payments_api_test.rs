mod common;

use std::time::Duration;

use axum::http::{Method, StatusCode};
use common::{TestApp, ESEWA_MERCHANT, ESEWA_SECRET, FRONTEND_URL};
use momosewa_api::entities::order::{OrderStatus, PaymentStatus};
use momosewa_api::events::Event;
use momosewa_api::services::payments::esewa::{format_amount, sign, signature_message};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use url::Url;
use wiremock::{
    matchers::{body_string_contains, header, method, path},
    Mock, ResponseTemplate,
};

const TRANSREC_SUCCESS: &str = "<response>\n<response_code>\nSuccess\n</response_code>\n</response>";
const TRANSREC_FAILURE: &str = "<response>\n<response_code>\nfailure\n</response_code>\n</response>";

/// Places a 600 rupee order (free delivery) paid through `method`.
async fn online_order(app: &TestApp, token: &str, payment_method: &str) -> Value {
    let vendor = app.seed_vendor("Momo House").await;
    let momo = app
        .seed_product(vendor.vendor.id, "Jhol momo", dec!(200), 100)
        .await;
    app.place_order(token, momo.id, 3, payment_method, None).await
}

/// Initiates eSewa for `order` and returns the transaction id.
async fn initiate_esewa(app: &TestApp, token: &str, order: &Value) -> String {
    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/payments/esewa/initiate",
            Some(json!({ "orderId": order["id"] })),
            Some(token),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "esewa initiate failed: {body}");
    body["data"]["transactionId"]
        .as_str()
        .expect("transaction id")
        .to_string()
}

fn signed_callback(oid: &str, amount: Decimal, ref_id: &str) -> Value {
    let amt = format_amount(amount);
    let signature = sign(
        ESEWA_SECRET,
        &signature_message(&amt, oid, ESEWA_MERCHANT),
    )
    .expect("sign callback");
    json!({ "oid": oid, "amt": amt, "refId": ref_id, "signature": signature })
}

async fn mock_transrec(app: &TestApp, body: &str) {
    Mock::given(method("POST"))
        .and(path("/epay/transrec"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&app.providers)
        .await;
}

async fn webhook(app: &TestApp, payload: Value) -> (StatusCode, Value) {
    app.request(Method::POST, "/api/v1/payments/esewa/webhook", Some(payload), None)
        .await
}

fn count(events: &[Event], name: &str) -> usize {
    events.iter().filter(|e| e.event_type() == name).count()
}

#[tokio::test]
async fn khalti_initiate_stores_pidx() {
    let app = TestApp::new().await;
    let customer = TestApp::customer();
    let order = online_order(&app, &customer.token, "khalti").await;

    Mock::given(method("POST"))
        .and(path("/epayment/initiate/"))
        .and(header("Authorization", "Key test-khalti-key"))
        .and(body_string_contains("\"amount\":60000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "pidx": "bZQLD9wRVWo4CdESSfuSsB",
            "payment_url": "https://test-pay.khalti.com/?pidx=bZQLD9wRVWo4CdESSfuSsB",
            "expires_at": "2026-10-19T13:00:00+05:45",
            "expires_in": 1800
        })))
        .expect(1)
        .mount(&app.providers)
        .await;

    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/payments/khalti/initiate",
            Some(json!({ "orderId": order["orderCode"], "amount": 600 })),
            Some(&customer.token),
        )
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["pidx"], "bZQLD9wRVWo4CdESSfuSsB");
    let stored = app.order(order["id"].as_str().unwrap()).await;
    assert_eq!(
        stored.khalti_transaction_id.as_deref(),
        Some("bZQLD9wRVWo4CdESSfuSsB")
    );
    assert_eq!(stored.payment_status, PaymentStatus::Pending);
}

#[tokio::test]
async fn khalti_initiate_rejects_wrong_amount_and_other_customers() {
    let app = TestApp::new().await;
    let customer = TestApp::customer();
    let order = online_order(&app, &customer.token, "khalti").await;

    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/payments/khalti/initiate",
            Some(json!({ "orderId": order["id"], "amount": 500 })),
            Some(&customer.token),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Payment amount does not match order total");

    let stranger = TestApp::customer();
    let (status, _) = app
        .request(
            Method::POST,
            "/api/v1/payments/khalti/initiate",
            Some(json!({ "orderId": order["id"] })),
            Some(&stranger.token),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/payments/khalti/initiate",
            Some(json!({})),
            Some(&customer.token),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["details"][0]["field"], "orderId");
}

#[tokio::test]
async fn khalti_initiate_refuses_cod_orders() {
    let app = TestApp::new().await;
    let customer = TestApp::customer();
    let order = online_order(&app, &customer.token, "cash-on-delivery").await;

    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/payments/khalti/initiate",
            Some(json!({ "orderId": order["id"] })),
            Some(&customer.token),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Order is not set up for Khalti payment");
}

async fn khalti_ready(app: &TestApp, token: &str) -> Value {
    let order = online_order(app, token, "khalti").await;
    Mock::given(method("POST"))
        .and(path("/epayment/initiate/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "pidx": "HT6o6PEZRWFJ5ygavzHWd5",
            "payment_url": "https://test-pay.khalti.com/?pidx=HT6o6PEZRWFJ5ygavzHWd5"
        })))
        .mount(&app.providers)
        .await;
    let (status, _) = app
        .request(
            Method::POST,
            "/api/v1/payments/khalti/initiate",
            Some(json!({ "orderId": order["id"] })),
            Some(token),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    order
}

async fn mock_lookup(app: &TestApp, total_amount: i64, status: &str) {
    Mock::given(method("POST"))
        .and(path("/epayment/lookup/"))
        .and(header("Authorization", "Key test-khalti-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "pidx": "HT6o6PEZRWFJ5ygavzHWd5",
            "total_amount": total_amount,
            "status": status,
            "transaction_id": "GFq9PFS7b2iYvL8Lir9oXe",
            "fee": 0,
            "refunded": false
        })))
        .mount(&app.providers)
        .await;
}

#[tokio::test]
async fn khalti_verify_marks_order_paid() {
    let app = TestApp::new().await;
    let customer = TestApp::customer();
    let order = khalti_ready(&app, &customer.token).await;
    mock_lookup(&app, 60_000, "Completed").await;

    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/payments/khalti/verify",
            Some(json!({ "pidx": "HT6o6PEZRWFJ5ygavzHWd5" })),
            Some(&customer.token),
        )
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["order"]["paymentStatus"], "paid");
    assert_eq!(body["data"]["order"]["status"], "pending");
    assert_eq!(body["data"]["payment"]["total_amount"], 60_000);

    let stored = app.order(order["id"].as_str().unwrap()).await;
    assert_eq!(stored.payment_status, PaymentStatus::Paid);
    assert_eq!(stored.status, OrderStatus::Pending);
    assert!(stored.paid_at.is_some());

    let events = app.drain_events().await;
    assert_eq!(count(&events, "payment_succeeded"), 1);
    assert_eq!(count(&events, "order_status_changed"), 0);
}

#[tokio::test]
async fn khalti_verify_rejects_amount_mismatch() {
    let app = TestApp::new().await;
    let customer = TestApp::customer();
    let order = khalti_ready(&app, &customer.token).await;
    mock_lookup(&app, 1_000, "Completed").await;

    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/payments/khalti/verify",
            Some(json!({ "pidx": "HT6o6PEZRWFJ5ygavzHWd5" })),
            Some(&customer.token),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Payment amount mismatch");
    let stored = app.order(order["id"].as_str().unwrap()).await;
    assert_eq!(stored.payment_status, PaymentStatus::Failed);
    assert_eq!(count(&app.drain_events().await, "payment_failed"), 1);
}

#[tokio::test]
async fn khalti_verify_leaves_incomplete_payment_alone() {
    let app = TestApp::new().await;
    let customer = TestApp::customer();
    let order = khalti_ready(&app, &customer.token).await;
    mock_lookup(&app, 60_000, "Pending").await;

    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/payments/khalti/verify",
            Some(json!({ "pidx": "HT6o6PEZRWFJ5ygavzHWd5" })),
            Some(&customer.token),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Payment not completed (status: Pending)");
    let stored = app.order(order["id"].as_str().unwrap()).await;
    assert_eq!(stored.payment_status, PaymentStatus::Pending);

    let (status, _) = app
        .request(
            Method::POST,
            "/api/v1/payments/khalti/verify",
            Some(json!({ "pidx": "unknown-pidx" })),
            Some(&customer.token),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn khalti_upstream_error_is_bad_gateway() {
    let app = TestApp::new().await;
    let customer = TestApp::customer();
    let order = online_order(&app, &customer.token, "khalti").await;
    Mock::given(method("POST"))
        .and(path("/epayment/initiate/"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&app.providers)
        .await;

    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/payments/khalti/initiate",
            Some(json!({ "orderId": order["id"] })),
            Some(&customer.token),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn esewa_initiate_builds_signed_form() {
    let app = TestApp::new().await;
    let customer = TestApp::customer();
    let order = online_order(&app, &customer.token, "esewa").await;

    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/payments/esewa/initiate",
            Some(json!({ "orderId": order["orderCode"] })),
            Some(&customer.token),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let data = &body["data"];
    let tx = data["transactionId"].as_str().unwrap();
    let code = order["orderCode"].as_str().unwrap();
    assert!(tx.starts_with(&format!("ORDER-{code}-")));
    assert_eq!(data["orderId"], code);

    let form = &data["formData"];
    assert_eq!(form["amt"], "600.00");
    assert_eq!(form["psc"], "0");
    assert_eq!(form["pdc"], "0.00");
    assert_eq!(form["txAmt"], "0");
    assert_eq!(form["tAmt"], "600.00");
    assert_eq!(form["pid"], tx);
    assert_eq!(form["scd"], ESEWA_MERCHANT);
    let expected = sign(
        ESEWA_SECRET,
        &signature_message("600.00", tx, ESEWA_MERCHANT),
    )
    .unwrap();
    assert_eq!(form["signature"], expected);

    let url = Url::parse(data["paymentUrl"].as_str().unwrap()).unwrap();
    assert_eq!(url.path(), "/epay/main");
    assert!(url.query_pairs().any(|(k, v)| k == "pid" && v == tx));

    let stored = app.order(order["id"].as_str().unwrap()).await;
    assert_eq!(stored.payment_status, PaymentStatus::Processing);
    assert_eq!(stored.esewa_transaction_id.as_deref(), Some(tx));
}

#[tokio::test]
async fn esewa_webhook_settles_once() {
    let app = TestApp::new().await;
    let customer = TestApp::customer();
    let order = online_order(&app, &customer.token, "esewa").await;
    let tx = initiate_esewa(&app, &customer.token, &order).await;
    Mock::given(method("POST"))
        .and(path("/epay/transrec"))
        .and(body_string_contains("rid=0007G36"))
        .respond_with(ResponseTemplate::new(200).set_body_string(TRANSREC_SUCCESS))
        .expect(1)
        .mount(&app.providers)
        .await;

    let callback = signed_callback(&tx, dec!(600), "0007G36");
    let (status, body) = webhook(&app, callback.clone()).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["message"], "Payment verified successfully");
    assert_eq!(body["data"]["alreadyProcessed"], false);
    assert_eq!(body["data"]["orderId"], order["orderCode"]);
    assert_eq!(body["data"]["refId"], "0007G36");

    let stored = app.order(order["id"].as_str().unwrap()).await;
    assert_eq!(stored.payment_status, PaymentStatus::Paid);
    assert_eq!(stored.status, OrderStatus::Preparing);
    assert_eq!(stored.esewa_ref_id.as_deref(), Some("0007G36"));

    let (status, body) = webhook(&app, callback).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Payment already processed");
    assert_eq!(body["data"]["alreadyProcessed"], true);

    let events = app.drain_events().await;
    assert_eq!(count(&events, "payment_succeeded"), 1);
    assert!(events.iter().any(|e| matches!(
        e,
        Event::OrderStatusChanged {
            old_status: OrderStatus::Pending,
            new_status: OrderStatus::Preparing,
            ..
        }
    )));
}

#[tokio::test]
async fn esewa_webhook_accepts_form_bodies() {
    let app = TestApp::new().await;
    let customer = TestApp::customer();
    let order = online_order(&app, &customer.token, "esewa").await;
    let tx = initiate_esewa(&app, &customer.token, &order).await;
    mock_transrec(&app, TRANSREC_SUCCESS).await;

    let signature = sign(
        ESEWA_SECRET,
        &signature_message("600.00", &tx, ESEWA_MERCHANT),
    )
    .unwrap();
    let form = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("oid", &tx)
        .append_pair("amt", "600.00")
        .append_pair("refId", "0008H47")
        .append_pair("signature", &signature)
        .finish();

    let (status, body) = app
        .post_form("/api/v1/payments/esewa/webhook", &form)
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(
        app.order(order["id"].as_str().unwrap()).await.payment_status,
        PaymentStatus::Paid
    );
}

#[tokio::test]
async fn esewa_webhook_rejects_tampered_signature() {
    let app = TestApp::new().await;
    let customer = TestApp::customer();
    let order = online_order(&app, &customer.token, "esewa").await;
    let tx = initiate_esewa(&app, &customer.token, &order).await;

    let mut callback = signed_callback(&tx, dec!(600), "0007G36");
    callback["signature"] = json!("dGFtcGVyZWQ=");
    let (status, body) = webhook(&app, callback).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Invalid payment signature");
    let stored = app.order(order["id"].as_str().unwrap()).await;
    assert_eq!(stored.payment_status, PaymentStatus::Failed);
    assert_eq!(stored.status, OrderStatus::Pending);
    assert_eq!(count(&app.drain_events().await, "payment_failed"), 1);
}

#[tokio::test]
async fn esewa_webhook_rejects_amount_mismatch() {
    let app = TestApp::new().await;
    let customer = TestApp::customer();
    let order = online_order(&app, &customer.token, "esewa").await;
    let tx = initiate_esewa(&app, &customer.token, &order).await;

    let (status, body) = webhook(&app, signed_callback(&tx, dec!(60), "0007G36")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Payment amount mismatch");
    assert_eq!(
        app.order(order["id"].as_str().unwrap()).await.payment_status,
        PaymentStatus::Failed
    );
}

#[tokio::test]
async fn esewa_webhook_requires_provider_confirmation() {
    let app = TestApp::new().await;
    let customer = TestApp::customer();
    let order = online_order(&app, &customer.token, "esewa").await;
    let tx = initiate_esewa(&app, &customer.token, &order).await;
    mock_transrec(&app, TRANSREC_FAILURE).await;

    let (status, body) = webhook(&app, signed_callback(&tx, dec!(600), "0007G36")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Payment verification failed");
    assert_eq!(
        app.order(order["id"].as_str().unwrap()).await.payment_status,
        PaymentStatus::Failed
    );
}

#[tokio::test]
async fn esewa_verification_timeout_is_retryable() {
    let app = TestApp::new().await;
    let customer = TestApp::customer();
    let order = online_order(&app, &customer.token, "esewa").await;
    let tx = initiate_esewa(&app, &customer.token, &order).await;
    Mock::given(method("POST"))
        .and(path("/epay/transrec"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(TRANSREC_SUCCESS)
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&app.providers)
        .await;

    let (status, body) = webhook(&app, signed_callback(&tx, dec!(600), "0007G36")).await;

    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["success"], false);
    let stored = app.order(order["id"].as_str().unwrap()).await;
    assert_eq!(stored.payment_status, PaymentStatus::Processing);
    let details = stored.payment_details.expect("audit recorded");
    assert_eq!(details["outcome"], "verification_unavailable");
    assert_eq!(count(&app.drain_events().await, "payment_failed"), 0);
}

#[tokio::test]
async fn esewa_webhook_validates_payload() {
    let app = TestApp::new().await;

    let (status, body) = webhook(&app, json!({ "amt": "600.00" })).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let fields: Vec<&str> = body["details"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["field"].as_str().unwrap())
        .collect();
    assert_eq!(fields, vec!["oid", "refId"]);

    let (status, _) = webhook(&app, signed_callback("ORDER-NOPE-1-abc", dec!(600), "R1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn esewa_skips_provider_check_when_disabled() {
    let app = TestApp::with_config(|cfg| cfg.esewa.verify_with_provider = false).await;
    let customer = TestApp::customer();
    let order = online_order(&app, &customer.token, "esewa").await;
    let tx = initiate_esewa(&app, &customer.token, &order).await;

    let (status, _) = webhook(&app, signed_callback(&tx, dec!(600), "0007G36")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        app.order(order["id"].as_str().unwrap()).await.payment_status,
        PaymentStatus::Paid
    );
}

#[tokio::test]
async fn esewa_success_redirect_points_to_checkout() {
    let app = TestApp::new().await;
    let customer = TestApp::customer();
    let order = online_order(&app, &customer.token, "esewa").await;
    let tx = initiate_esewa(&app, &customer.token, &order).await;
    let code = order["orderCode"].as_str().unwrap();

    let (status, location) = app
        .redirect(&format!(
            "/api/v1/payments/esewa/success?oid={tx}&amt=600.00&refId=0007G36"
        ))
        .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(
        location,
        format!("{FRONTEND_URL}/checkout/success?orderId={code}&transactionId={tx}")
    );
    assert_eq!(
        app.order(order["id"].as_str().unwrap()).await.payment_status,
        PaymentStatus::Processing
    );

    let (_, location) = app.redirect("/api/v1/payments/esewa/success").await;
    assert_eq!(
        location,
        format!("{FRONTEND_URL}/checkout/failure?error=missing_parameters")
    );

    let (_, location) = app
        .redirect("/api/v1/payments/esewa/success?oid=ORDER-NOPE-1-abc")
        .await;
    assert_eq!(
        location,
        format!("{FRONTEND_URL}/checkout/failure?error=order_not_found")
    );
}

#[tokio::test]
async fn esewa_failure_redirect_marks_payment_failed() {
    let app = TestApp::new().await;
    let customer = TestApp::customer();
    let order = online_order(&app, &customer.token, "esewa").await;
    let tx = initiate_esewa(&app, &customer.token, &order).await;
    let code = order["orderCode"].as_str().unwrap();

    let (status, location) = app
        .redirect(&format!("/api/v1/payments/esewa/failure?oid={tx}"))
        .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(
        location,
        format!("{FRONTEND_URL}/checkout/failure?orderId={code}&error=payment_failed")
    );
    assert_eq!(
        app.order(order["id"].as_str().unwrap()).await.payment_status,
        PaymentStatus::Failed
    );

    let (_, location) = app.redirect("/api/v1/payments/esewa/failure").await;
    assert_eq!(
        location,
        format!("{FRONTEND_URL}/checkout/failure?error=payment_failed")
    );
}

#[tokio::test]
async fn failure_redirect_never_downgrades_paid_order() {
    let app = TestApp::new().await;
    let customer = TestApp::customer();
    let order = online_order(&app, &customer.token, "esewa").await;
    let tx = initiate_esewa(&app, &customer.token, &order).await;
    mock_transrec(&app, TRANSREC_SUCCESS).await;
    let (status, _) = webhook(&app, signed_callback(&tx, dec!(600), "0007G36")).await;
    assert_eq!(status, StatusCode::OK);

    app.redirect(&format!("/api/v1/payments/esewa/failure?oid={tx}"))
        .await;

    assert_eq!(
        app.order(order["id"].as_str().unwrap()).await.payment_status,
        PaymentStatus::Paid
    );
}

#[tokio::test]
async fn esewa_status_and_transactions_are_owner_scoped() {
    let app = TestApp::new().await;
    let customer = TestApp::customer();
    let order = online_order(&app, &customer.token, "esewa").await;
    let tx = initiate_esewa(&app, &customer.token, &order).await;

    let uri = format!("/api/v1/payments/esewa/verify/{tx}");
    let (status, body) = app
        .request(Method::GET, &uri, None, Some(&customer.token))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["paymentStatus"], "processing");
    assert_eq!(body["data"]["orderId"], order["orderCode"]);
    assert_eq!(body["data"]["transactionId"], tx.as_str());

    let stranger = TestApp::customer();
    let (status, _) = app
        .request(Method::GET, &uri, None, Some(&stranger.token))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .request(
            Method::GET,
            "/api/v1/payments/transactions",
            None,
            Some(&customer.token),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let transactions = body["data"]["transactions"].as_array().unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0]["paymentMethod"], "esewa");
    assert_eq!(transactions[0]["total"], 600.0);

    let (status, _) = app
        .request(
            Method::GET,
            "/api/v1/payments/transactions",
            None,
            Some(&TestApp::admin_token()),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

async fn cancel(app: &TestApp, token: &str, order: &Value) {
    let uri = format!("/api/v1/orders/{}/cancel", order["id"].as_str().unwrap());
    let (status, body) = app
        .request(
            Method::PUT,
            &uri,
            Some(json!({ "reason": "Changed my mind" })),
            Some(token),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "cancel failed: {body}");
}

#[tokio::test]
async fn esewa_payment_after_cancellation_is_refunded() {
    let app = TestApp::new().await;
    let customer = TestApp::customer();
    let order = online_order(&app, &customer.token, "esewa").await;
    let tx = initiate_esewa(&app, &customer.token, &order).await;
    cancel(&app, &customer.token, &order).await;
    mock_transrec(&app, TRANSREC_SUCCESS).await;

    let callback = signed_callback(&tx, dec!(600), "0009J58");
    let (status, body) = webhook(&app, callback.clone()).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["alreadyProcessed"], false);

    let stored = app.order(order["id"].as_str().unwrap()).await;
    assert_eq!(stored.status, OrderStatus::Cancelled);
    assert_eq!(stored.payment_status, PaymentStatus::Refunded);
    assert_eq!(stored.esewa_ref_id.as_deref(), Some("0009J58"));

    // A redelivered callback must not queue a second refund.
    let (status, body) = webhook(&app, callback).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["alreadyProcessed"], true);

    let events = app.drain_events().await;
    assert_eq!(count(&events, "payment_succeeded"), 1);
    assert_eq!(count(&events, "refund_requested"), 1);
    assert_eq!(count(&events, "order_status_changed"), 0);
    assert!(events.iter().any(|e| matches!(
        e,
        Event::RefundRequested { amount, .. } if *amount == dec!(600)
    )));
}

#[tokio::test]
async fn khalti_payment_after_cancellation_is_refunded() {
    let app = TestApp::new().await;
    let customer = TestApp::customer();
    let order = khalti_ready(&app, &customer.token).await;
    cancel(&app, &customer.token, &order).await;
    mock_lookup(&app, 60_000, "Completed").await;

    let verify = || {
        app.request(
            Method::POST,
            "/api/v1/payments/khalti/verify",
            Some(json!({ "pidx": "HT6o6PEZRWFJ5ygavzHWd5" })),
            Some(&customer.token),
        )
    };
    let (status, body) = verify().await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["order"]["status"], "cancelled");
    assert_eq!(body["data"]["order"]["paymentStatus"], "refunded");

    let (status, _) = verify().await;
    assert_eq!(status, StatusCode::OK);

    let stored = app.order(order["id"].as_str().unwrap()).await;
    assert_eq!(stored.payment_status, PaymentStatus::Refunded);
    let events = app.drain_events().await;
    assert_eq!(count(&events, "payment_succeeded"), 1);
    assert_eq!(count(&events, "refund_requested"), 1);
}

#[tokio::test]
async fn khalti_verify_reports_conflict_when_order_moves_mid_lookup() {
    let app = TestApp::with_config(|cfg| cfg.payment_timeout_ms = 3_000).await;
    let customer = TestApp::customer();
    let vendor = app.seed_vendor("Momo House").await;
    let momo = app
        .seed_product(vendor.vendor.id, "Jhol momo", dec!(200), 100)
        .await;
    let order = app
        .place_order(&customer.token, momo.id, 3, "khalti", None)
        .await;
    Mock::given(method("POST"))
        .and(path("/epayment/initiate/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "pidx": "HT6o6PEZRWFJ5ygavzHWd5",
            "payment_url": "https://test-pay.khalti.com/?pidx=HT6o6PEZRWFJ5ygavzHWd5"
        })))
        .mount(&app.providers)
        .await;
    let (status, _) = app
        .request(
            Method::POST,
            "/api/v1/payments/khalti/initiate",
            Some(json!({ "orderId": order["id"] })),
            Some(&customer.token),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    Mock::given(method("POST"))
        .and(path("/epayment/lookup/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "pidx": "HT6o6PEZRWFJ5ygavzHWd5",
                    "total_amount": 60_000,
                    "status": "Completed",
                    "transaction_id": "GFq9PFS7b2iYvL8Lir9oXe"
                }))
                .set_delay(Duration::from_millis(600)),
        )
        .mount(&app.providers)
        .await;

    let status_uri = format!("/api/v1/orders/{}/status", order["id"].as_str().unwrap());
    let (verified, moved) = tokio::join!(
        app.request(
            Method::POST,
            "/api/v1/payments/khalti/verify",
            Some(json!({ "pidx": "HT6o6PEZRWFJ5ygavzHWd5" })),
            Some(&customer.token),
        ),
        async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            app.request(
                Method::PUT,
                &status_uri,
                Some(json!({ "status": "preparing" })),
                Some(&vendor.owner_token),
            )
            .await
        }
    );

    assert_eq!(moved.0, StatusCode::OK, "{}", moved.1);
    assert_eq!(verified.0, StatusCode::CONFLICT, "{}", verified.1);
    let stored = app.order(order["id"].as_str().unwrap()).await;
    assert_eq!(stored.status, OrderStatus::Preparing);
    assert_eq!(stored.payment_status, PaymentStatus::Pending);
    assert_eq!(count(&app.drain_events().await, "payment_succeeded"), 0);
}
