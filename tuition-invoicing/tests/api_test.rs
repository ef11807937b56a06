//! HTTP surface tests, driven through the router without a listener.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{item, receivable, MemoryStore};
use http_body_util::BodyExt;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use tower::ServiceExt;
use tuition_invoicing::services::{CommitMode, ReconciliationCommitter};
use tuition_invoicing::startup::{router, AppState};

fn app(store: &Arc<MemoryStore>) -> Router {
    router(AppState::new(ReconciliationCommitter::new(
        store.clone(),
        CommitMode::BestEffort,
    )))
}

fn seeded() -> Arc<MemoryStore> {
    Arc::new(
        MemoryStore::new()
            .with_invoice(receivable(42, Some(4)))
            .with_item(42, item(1, "Tutoring", dec!(2), dec!(25))),
    )
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn put_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn decimal(value: &Value) -> Decimal {
    Decimal::from_str(value.as_str().unwrap()).unwrap()
}

#[tokio::test]
async fn health_check_works() {
    let store = seeded();
    let (status, body) = send(
        app(&store),
        Request::get("/health").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "tuition-invoicing");
}

#[tokio::test]
async fn health_check_reports_unavailable_store() {
    let store = seeded();
    store.fail_health();

    let (status, body) = send(
        app(&store),
        Request::get("/health").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
}

#[tokio::test]
async fn responses_carry_request_id() {
    let store = seeded();
    let response = app(&store)
        .oneshot(
            Request::get("/ready")
                .header("x-request-id", "edit-session-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "edit-session-1");
}

#[tokio::test]
async fn get_line_items_returns_rows_and_draft_total() {
    let store = seeded();
    let (status, body) = send(
        app(&store),
        Request::get("/api/invoices/42/line-items")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["header"]["invoice_id"], 42);
    assert_eq!(body["line_items"].as_array().unwrap().len(), 1);
    assert_eq!(body["line_items"][0]["id"]["state"], "persisted");
    assert_eq!(decimal(&body["computed_total"]), dec!(100));
}

#[tokio::test]
async fn get_line_items_of_unknown_invoice_is_404() {
    let store = seeded();
    let (status, _) = send(
        app(&store),
        Request::get("/api/invoices/404/line-items")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn save_applies_edits_and_returns_total() {
    let store = seeded();
    let (status, body) = send(
        app(&store),
        put_json(
            "/api/invoices/42/line-items",
            json!({
                "line_items": [
                    {"id": 1, "description": "Tutoring", "period": "March 2024",
                     "lesson_count": "6", "rate": "25"},
                    {"description": "Tutoring", "period": "March 2024",
                     "lesson_count": "1", "rate": "25"}
                ]
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["summary"], "all 2 changes saved");
    assert_eq!(body["mode"], "best_effort");
    assert_eq!(decimal(&body["total"]), dec!(250));
    assert_eq!(store.items(42).len(), 2);
}

#[tokio::test]
async fn save_deletes_rows_missing_from_request() {
    let store = seeded();
    let (status, body) = send(
        app(&store),
        put_json("/api/invoices/42/line-items", json!({ "line_items": [] })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["applied"][0]["type"], "delete");
    assert!(store.items(42).is_empty());
    assert_eq!(store.header(42).unwrap().total, Decimal::ZERO);
}

#[tokio::test]
async fn save_rejects_row_from_another_invoice() {
    let store = seeded();
    let (status, _) = send(
        app(&store),
        put_json(
            "/api/invoices/42/line-items",
            json!({
                "line_items": [
                    {"id": 77, "description": "Tutoring", "lesson_count": "1", "rate": "25"}
                ]
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(store.items(42).len(), 1);
}

#[tokio::test]
async fn save_rejects_invalid_new_row() {
    let store = seeded();
    let (status, body) = send(
        app(&store),
        put_json(
            "/api/invoices/42/line-items",
            json!({
                "line_items": [
                    {"id": 1, "description": "Tutoring", "period": "March 2024",
                     "lesson_count": "2", "rate": "25"},
                    {"description": "", "lesson_count": "1", "rate": "25"}
                ]
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "Validation error");
}

#[tokio::test]
async fn invalid_edit_of_existing_row_fails_only_that_row() {
    let store = seeded();
    let (status, body) = send(
        app(&store),
        put_json(
            "/api/invoices/42/line-items",
            json!({
                "line_items": [
                    {"id": 1, "description": "", "period": "March 2024",
                     "lesson_count": "2", "rate": "25"},
                    {"description": "Tutoring", "period": "March 2024",
                     "lesson_count": "5", "rate": "25"}
                ]
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::MULTI_STATUS);
    assert_eq!(body["failures"][0]["operation"]["type"], "update");
    assert_eq!(body["failures"][0]["kind"], "validation");
    assert_eq!(body["applied"][0]["type"], "create");
    assert_eq!(store.items(42).len(), 2);
    assert_eq!(store.items(42)[0].description, "Tutoring");
    assert_eq!(decimal(&body["total"]), dec!(225));
}

#[tokio::test]
async fn partial_failure_is_multi_status() {
    let store = seeded();
    store.fail_update(1);

    let (status, body) = send(
        app(&store),
        put_json(
            "/api/invoices/42/line-items",
            json!({
                "line_items": [
                    {"id": 1, "description": "Tutoring", "period": "March 2024",
                     "lesson_count": "6", "rate": "25"},
                    {"description": "Tutoring", "period": "March 2024",
                     "lesson_count": "5", "rate": "25"}
                ]
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::MULTI_STATUS);
    assert_eq!(body["summary"], "some changes saved, 1 failed");
    assert_eq!(body["failures"][0]["operation"]["type"], "update");
    assert_eq!(body["failures"][0]["kind"], "persistence");
    // Stored row 1 still bills the 4-lesson floor.
    assert_eq!(decimal(&body["total"]), dec!(225));
}

#[tokio::test]
async fn atomic_failure_is_conflict() {
    let store = seeded();
    store.fail_delete(1);

    let (status, body) = send(
        app(&store),
        put_json(
            "/api/invoices/42/line-items",
            json!({ "mode": "atomic", "line_items": [] }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["rolled_back"], true);
    assert_eq!(body["mode"], "atomic");
    assert_eq!(store.items(42).len(), 1);
}

#[tokio::test]
async fn recompute_endpoint_writes_total() {
    let store = seeded();
    let response = app(&store)
        .oneshot(
            Request::post("/api/invoices/42/total")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["invoice_id"], 42);
    assert_eq!(decimal(&body["total"]), dec!(100));
    assert_eq!(store.header(42).unwrap().total, dec!(100));
}
