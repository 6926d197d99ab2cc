//! HTTP surface exercised in-process.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use delivery_orderservice::{
    app_state::AppState, realtime::LocalBus, routes, stores::MemoryStore,
};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

fn app() -> Router {
    let state = AppState::new(Arc::new(MemoryStore::new()), Arc::new(LocalBus::new()), 500);
    let (router, _openapi) = routes::routes_with_openapi().split_for_parts();
    router.with_state(state)
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    driver: Option<Uuid>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(driver) = driver {
        request = request.header("X-Driver-Id", driver.to_string());
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
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn preparing_order(app: &Router, store_id: Uuid) -> Uuid {
    let (status, body) = send(
        app,
        "POST",
        &format!("/stores/{}/orders", store_id),
        None,
        Some(json!({ "delivery_type": "delivery" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "entrada");
    let id: Uuid = body["data"]["id"].as_str().unwrap().parse().unwrap();

    let (status, body) = send(
        app,
        "PATCH",
        &format!("/orders/{}/status", id),
        None,
        Some(json!({ "status": "em_preparo", "expected_status": "entrada" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "em_preparo");
    id
}

#[tokio::test]
async fn driver_routes_require_a_driver_id() {
    let app = app();
    let (status, body) = send(
        &app,
        "GET",
        &format!("/stores/{}/available-orders", Uuid::new_v4()),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn claim_race_over_http_reports_already_claimed() {
    let app = app();
    let store_id = Uuid::new_v4();
    let order_id = preparing_order(&app, store_id).await;
    let (driver_a, driver_b) = (Uuid::new_v4(), Uuid::new_v4());

    let (status, body) = send(
        &app,
        "GET",
        &format!("/stores/{}/available-orders", store_id),
        Some(driver_a),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let claim = format!("/orders/{}/claim", order_id);
    let (status, body) = send(&app, "POST", &claim, Some(driver_a), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "claimed");

    let (status, body) = send(&app, "POST", &claim, Some(driver_b), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "already_claimed");
    assert_eq!(
        body["data"]["order"]["assigned_driver_id"],
        driver_a.to_string()
    );
}

#[tokio::test]
async fn full_delivery_over_http() {
    let app = app();
    let store_id = Uuid::new_v4();
    let driver = Uuid::new_v4();
    let order_id = preparing_order(&app, store_id).await;

    let (_, body) = send(
        &app,
        "POST",
        &format!("/orders/{}/claim", order_id),
        Some(driver),
        None,
    )
    .await;
    let assignment_id = body["data"]["assignment"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        "POST",
        &format!("/assignments/{}/accept", assignment_id),
        Some(driver),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "accepted");

    let picked_up = format!("/assignments/{}/picked-up", assignment_id);
    let (status, _) = send(&app, "POST", &picked_up, Some(driver), None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = send(
        &app,
        "PATCH",
        &format!("/orders/{}/status", order_id),
        None,
        Some(json!({ "status": "aguarda_retirada" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, "POST", &picked_up, Some(driver), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["order"]["status"], "em_transito");
    assert_eq!(body["data"]["display_status"], "picked_up");

    let (status, body) = send(&app, "GET", "/drivers/me/assignments", Some(driver), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, body) = send(
        &app,
        "POST",
        &format!("/assignments/{}/delivered", assignment_id),
        Some(driver),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["order"]["status"], "concluido");
    assert!(body["data"]["order"]["completed_at"].is_string());

    let (_, body) = send(&app, "GET", "/drivers/me/earnings", Some(driver), None).await;
    assert_eq!(body["data"]["total_cents"], 500);

    let (_, body) = send(&app, "GET", "/drivers/me/assignments", Some(driver), None).await;
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn operator_errors_map_to_statuses() {
    let app = app();
    let store_id = Uuid::new_v4();
    let order_id = preparing_order(&app, store_id).await;
    let status_uri = format!("/orders/{}/status", order_id);

    let (status, _) = send(
        &app,
        "PATCH",
        &status_uri,
        None,
        Some(json!({ "status": "concluido" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = send(
        &app,
        "PATCH",
        &status_uri,
        None,
        Some(json!({ "status": "aguarda_retirada", "expected_status": "entrada" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(
        &app,
        "PATCH",
        &status_uri,
        None,
        Some(json!({ "status": "cancelado" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        "DELETE",
        &format!("/orders/{}/driver", order_id),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&app, "GET", &format!("/orders/{}", Uuid::new_v4()), None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app,
        "POST",
        &format!("/orders/{}/cancel", order_id),
        None,
        Some(json!({ "reason": "out of stock" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "cancelado");
    assert_eq!(body["data"]["cancellation_reason"], "out of stock");

    let (_, body) = send(&app, "GET", &format!("/stores/{}/orders", store_id), None, None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}
