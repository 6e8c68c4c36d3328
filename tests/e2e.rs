use std::path::Path;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use http_body_util::BodyExt;
use netbank::auth::{AuthConfig, SessionGate};
use netbank::http::{AppState, router};
use netbank::ledger::TransferLog;
use netbank::store::{AccountStore, Accounts};
use netbank::{Amount, Engine};
use serde_json::{Value, json};
use tower::ServiceExt;

fn app_with(store: Arc<Accounts>, ledger: Arc<TransferLog>, static_dir: Option<&Path>) -> Router {
    let engine = Arc::new(Engine::new(store.clone(), ledger));
    let gate = Arc::new(SessionGate::new(store, AuthConfig::default()));
    router(AppState { engine, gate }, static_dir)
}

fn app() -> (Router, Arc<Accounts>) {
    let store = Arc::new(Accounts::in_memory());
    let app = app_with(store.clone(), Arc::new(TransferLog::in_memory()), None);
    (app, store)
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

async fn post(app: &Router, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
    call(app, Method::POST, uri, token, Some(body)).await
}

async fn signup(app: &Router, name: &str, account: &str, mobile: &str, pin: &str) {
    let (status, body) = post(
        app,
        "/signup",
        None,
        json!({
            "name": name,
            "branch": "Main",
            "accountNumber": account,
            "mobileNumber": mobile,
            "pin": pin,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["message"], "User signed up successfully.");
}

async fn login(app: &Router, name: &str, pin: &str) -> String {
    let (status, body) = post(app, "/login", None, json!({"username": name, "pin": pin})).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["message"], "Login successful!");
    body["token"].as_str().unwrap().to_string()
}

async fn balance(app: &Router, token: &str, pin: &str) -> Value {
    let (status, body) = post(app, "/api/balance", Some(token), json!({"pin": pin})).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body["balance"].clone()
}

/// Alice (A1) and Bob (B2), both logged in.
async fn alice_and_bob(app: &Router) -> (String, String) {
    signup(app, "alice", "A1", "9000", "1234").await;
    signup(app, "bob", "B2", "9111", "5678").await;
    (login(app, "alice", "1234").await, login(app, "bob", "5678").await)
}

fn transfer_body(receiver: &str, mobile: &str, pin: &str, amount: Value) -> Value {
    json!({
        "receiverAccountNumber": receiver,
        "mobileNumber": mobile,
        "transferPin": pin,
        "amount": amount,
    })
}

// Accounts and sessions

#[tokio::test]
async fn new_account_starts_with_opening_balance() {
    let (app, _) = app();
    signup(&app, "alice", "A1", "9000", "1234").await;
    let token = login(&app, "alice", "1234").await;

    assert_eq!(balance(&app, &token, "1234").await, 50_000);

    let (status, body) = post(&app, "/api/verify-pin", Some(&token), json!({"pin": "1234"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], 50_000);
}

#[tokio::test]
async fn wrong_pin_on_balance_endpoints() {
    let (app, _) = app();
    signup(&app, "alice", "A1", "9000", "1234").await;
    let token = login(&app, "alice", "1234").await;

    for uri in ["/api/balance", "/api/verify-pin"] {
        let (status, body) = post(&app, uri, Some(&token), json!({"pin": "0000"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"message": "Invalid PIN"}));
    }
}

#[tokio::test]
async fn duplicate_signup_and_bad_login() {
    let (app, _) = app();
    signup(&app, "alice", "A1", "9000", "1234").await;

    let (status, body) = post(
        &app,
        "/signup",
        None,
        json!({
            "name": "eve",
            "branch": "Main",
            "accountNumber": "A1",
            "mobileNumber": "9999",
            "pin": "1111",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "DUPLICATE_ACCOUNT");

    let (status, body) = post(
        &app,
        "/login",
        None,
        json!({"username": "alice", "pin": "9999"}),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Invalid username or PIN.");
}

#[tokio::test]
async fn endpoints_require_a_session() {
    let (app, _) = app();

    let (status, body) = post(&app, "/api/balance", None, json!({"pin": "1234"})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "User not logged in.");

    let (status, _) = post(
        &app,
        "/transfer",
        Some("forged"),
        transfer_body("B2", "9111", "1234", json!(10)),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// Transfers

#[tokio::test]
async fn transfer_moves_money() {
    let (app, store) = app();
    let (alice, bob) = alice_and_bob(&app).await;

    let (status, body) = post(
        &app,
        "/transfer",
        Some(&alice),
        transfer_body("B2", "9111", "1234", json!(1000)),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["message"], "Amount transferred successfully.");
    assert_eq!(body["balance"], 49_000);
    assert_eq!(body["replayed"], false);

    assert_eq!(balance(&app, &alice, "1234").await, 49_000);
    assert_eq!(balance(&app, &bob, "5678").await, 51_000);
    assert_eq!(store.total_balance().await.unwrap(), Amount::new(100_000));
}

#[tokio::test]
async fn amount_may_be_a_numeric_string() {
    let (app, _) = app();
    let (alice, _) = alice_and_bob(&app).await;

    let (status, _) = post(
        &app,
        "/transfer",
        Some(&alice),
        transfer_body("B2", "9111", "1234", json!("250")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(balance(&app, &alice, "1234").await, 49_750);

    let (status, body) = post(
        &app,
        "/transfer",
        Some(&alice),
        transfer_body("B2", "9111", "1234", json!("lots")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_AMOUNT");
}

#[tokio::test]
async fn fractional_huge_or_missing_amounts_are_invalid() {
    let (app, _) = app();
    let (alice, _) = alice_and_bob(&app).await;

    for amount in [json!(10.5), json!(1e20), Value::Null] {
        let (status, body) = post(
            &app,
            "/transfer",
            Some(&alice),
            transfer_body("B2", "9111", "1234", amount.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{amount}: {body}");
        assert_eq!(body["code"], "INVALID_AMOUNT", "{amount}");
    }
    assert_eq!(balance(&app, &alice, "1234").await, 50_000);
}

#[tokio::test]
async fn malformed_bodies_get_json_errors() {
    let (app, _) = app();
    let (alice, _) = alice_and_bob(&app).await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/transfer")
        .header(header::AUTHORIZATION, format!("Bearer {alice}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"receiverAccountNumber\": "))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["code"], "BAD_REQUEST");

    // well-formed JSON missing a field is a bad request too
    let (status, body) = post(&app, "/login", None, json!({"username": "alice"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn rejected_transfers_leave_balances_alone() {
    let (app, _) = app();
    let (alice, bob) = alice_and_bob(&app).await;

    let cases = [
        (
            transfer_body("B2", "0000", "1234", json!(1000)),
            StatusCode::NOT_FOUND,
            "Receiver mobile number does not match. Transfer failed.",
        ),
        (
            transfer_body("ZZ", "9111", "1234", json!(1000)),
            StatusCode::NOT_FOUND,
            "Receiver account number not found. Transfer failed.",
        ),
        (
            transfer_body("B2", "9111", "0000", json!(1000)),
            StatusCode::BAD_REQUEST,
            "Invalid PIN. Transfer failed.",
        ),
        (
            transfer_body("B2", "9111", "1234", json!(0)),
            StatusCode::BAD_REQUEST,
            "Invalid amount 0. Transfer failed.",
        ),
        (
            transfer_body("A1", "9000", "1234", json!(10)),
            StatusCode::BAD_REQUEST,
            "Cannot transfer to your own account. Transfer failed.",
        ),
        (
            transfer_body("B2", "9111", "1234", json!(50_001)),
            StatusCode::BAD_REQUEST,
            "Insufficient balance. Transfer failed.",
        ),
    ];

    for (body, expected_status, expected_error) in cases {
        let (status, response) = post(&app, "/transfer", Some(&alice), body).await;
        assert_eq!(status, expected_status, "{response}");
        assert_eq!(response["error"], expected_error);
    }

    assert_eq!(balance(&app, &alice, "1234").await, 50_000);
    assert_eq!(balance(&app, &bob, "5678").await, 50_000);
}

#[tokio::test]
async fn retried_request_id_is_applied_once() {
    let (app, _) = app();
    let (alice, bob) = alice_and_bob(&app).await;

    let mut body = transfer_body("B2", "9111", "1234", json!(1000));
    body["requestId"] = json!("pay-rent-1");

    let (status, first) = post(&app, "/transfer", Some(&alice), body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["requestId"], "pay-rent-1");

    let (status, second) = post(&app, "/transfer", Some(&alice), body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["replayed"], true);

    assert_eq!(balance(&app, &alice, "1234").await, 49_000);
    assert_eq!(balance(&app, &bob, "5678").await, 51_000);

    // same id, different amount
    body["amount"] = json!(2000);
    let (status, reused) = post(&app, "/transfer", Some(&alice), body).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(reused["code"], "REQUEST_ID_REUSED");
}

#[tokio::test]
async fn transfer_status_is_visible_to_sender_only() {
    let (app, _) = app();
    let (alice, bob) = alice_and_bob(&app).await;

    let mut body = transfer_body("B2", "9111", "1234", json!(75_000));
    body["requestId"] = json!("too-much");
    let (status, _) = post(&app, "/transfer", Some(&alice), body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, entry) = call(&app, Method::GET, "/transfer/too-much", Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entry["status"], "failed");
    assert_eq!(entry["reason"], "insufficient_funds");
    assert_eq!(entry["amount"], 75_000);

    let (status, _) = call(&app, Method::GET, "/transfer/too-much", Some(&bob), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = call(&app, Method::GET, "/transfer/never-sent", Some(&alice), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_transfers_over_http_conserve_money() {
    let (app, store) = app();
    let (alice, bob) = alice_and_bob(&app).await;

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let app = app.clone();
            let (token, receiver, mobile, pin) = if i % 2 == 0 {
                (alice.clone(), "B2", "9111", "1234")
            } else {
                (bob.clone(), "A1", "9000", "5678")
            };
            tokio::spawn(async move {
                post(
                    &app,
                    "/transfer",
                    Some(&token),
                    transfer_body(receiver, mobile, pin, json!(100 + i)),
                )
                .await
                .0
            })
        })
        .collect();

    for handle in handles {
        let status = handle.await.unwrap();
        assert!(
            status == StatusCode::OK || status == StatusCode::CONFLICT,
            "unexpected {status}"
        );
    }
    assert_eq!(store.total_balance().await.unwrap(), Amount::new(100_000));
}

// Persistence and static files

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let accounts = dir.path().join("accounts.csv");
    let ledger = dir.path().join("ledger.csv");

    {
        let app = app_with(
            Arc::new(Accounts::open(&accounts).unwrap()),
            Arc::new(TransferLog::open(&ledger).unwrap()),
            None,
        );
        let (alice, _) = alice_and_bob(&app).await;
        let mut body = transfer_body("B2", "9111", "1234", json!(1500));
        body["requestId"] = json!("before-restart");
        let (status, _) = post(&app, "/transfer", Some(&alice), body).await;
        assert_eq!(status, StatusCode::OK);
    }

    let app = app_with(
        Arc::new(Accounts::open(&accounts).unwrap()),
        Arc::new(TransferLog::open(&ledger).unwrap()),
        None,
    );
    let alice = login(&app, "alice", "1234").await;
    assert_eq!(balance(&app, &alice, "1234").await, 48_500);

    let (status, entry) = call(
        &app,
        Method::GET,
        "/transfer/before-restart",
        Some(&alice),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entry["status"], "committed");
}

#[tokio::test]
async fn unknown_paths_fall_back_to_static_files() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>netbank</h1>").unwrap();
    let app = app_with(
        Arc::new(Accounts::in_memory()),
        Arc::new(TransferLog::in_memory()),
        Some(dir.path()),
    );

    let request = Request::builder()
        .uri("/index.html")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"<h1>netbank</h1>");

    let request = Request::builder()
        .uri("/missing.css")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
