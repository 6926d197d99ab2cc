use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use uuid::Uuid;

use crate::{
    app_error::{AppError, StdResponse},
    app_state::AppState,
    domain::{DeliveryAssignment, DeliveryType, NewOrder, Order, OrderStatus},
    state_machine::Actor,
};

/// Store-operator routes. Operators are trusted callers behind the gateway.
pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(utoipa_axum::routes!(create_order))
        .routes(utoipa_axum::routes!(get_store_orders))
        .routes(utoipa_axum::routes!(get_order))
        .routes(utoipa_axum::routes!(update_order_status))
        .routes(utoipa_axum::routes!(cancel_order))
        .routes(utoipa_axum::routes!(remove_driver))
}

#[derive(Deserialize, ToSchema)]
pub struct CreateOrderReq {
    pub delivery_type: DeliveryType,
}

/// Create an order for a store. It starts in `entrada`.
#[utoipa::path(
    post,
    path = "/stores/{store_id}/orders",
    tags = ["Orders"],
    params(
        ("store_id" = Uuid, Path, description = "Store receiving the order")
    ),
    request_body = CreateOrderReq,
    responses(
        (status = 200, description = "Order created", body = StdResponse<Order, String>)
    )
)]
async fn create_order(
    Path(store_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<CreateOrderReq>,
) -> Result<impl IntoResponse, AppError> {
    let order = state
        .lifecycle
        .create_order(NewOrder {
            store_id,
            delivery_type: payload.delivery_type,
        })
        .await?;

    Ok(StdResponse {
        data: Some(order),
        message: Some("Order created successfully"),
    })
}

/// Fetch all orders of a store.
#[utoipa::path(
    get,
    path = "/stores/{store_id}/orders",
    tags = ["Orders"],
    params(
        ("store_id" = Uuid, Path, description = "Store to list")
    ),
    responses(
        (status = 200, description = "List store orders", body = StdResponse<Vec<Order>, String>)
    )
)]
async fn get_store_orders(
    Path(store_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let orders = state.lifecycle.list_orders(store_id).await?;

    Ok(StdResponse {
        data: Some(orders),
        message: Some("Get orders successfully"),
    })
}

/// Fetch a specific order.
#[utoipa::path(
    get,
    path = "/orders/{id}",
    tags = ["Orders"],
    params(
        ("id" = Uuid, Path, description = "Order ID to fetch")
    ),
    responses(
        (status = 200, description = "Get order successfully", body = StdResponse<Order, String>),
        (status = 404, description = "Order not found")
    )
)]
async fn get_order(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let order = state.lifecycle.get_order(id).await?;

    Ok(StdResponse {
        data: Some(order),
        message: Some("Get order successfully"),
    })
}

#[derive(Deserialize, ToSchema)]
pub struct UpdateOrderStatusReq {
    pub status: OrderStatus,
    /// Status the operator was looking at. The write fails with 409 if it moved.
    pub expected_status: Option<OrderStatus>,
}

/// Move an order one step along its status graph.
#[utoipa::path(
    patch,
    path = "/orders/{id}/status",
    tags = ["Orders"],
    params(
        ("id" = Uuid, Path, description = "Order ID to update")
    ),
    request_body = UpdateOrderStatusReq,
    responses(
        (status = 200, description = "Order status updated", body = StdResponse<Order, String>),
        (status = 409, description = "Order changed since it was read"),
        (status = 422, description = "Transition not allowed")
    )
)]
async fn update_order_status(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<UpdateOrderStatusReq>,
) -> Result<impl IntoResponse, AppError> {
    if payload.status == OrderStatus::Cancelado {
        return Err(AppError::BadRequest(
            "Use the cancel endpoint to cancel an order".into(),
        ));
    }

    let order = state
        .lifecycle
        .advance(id, payload.status, payload.expected_status, Actor::Operator)
        .await?;

    Ok(StdResponse {
        data: Some(order),
        message: Some("Order status updated successfully"),
    })
}

#[derive(Deserialize, ToSchema)]
pub struct CancelOrderReq {
    pub reason: String,
}

/// Cancel an order, releasing its driver if one is attached.
#[utoipa::path(
    post,
    path = "/orders/{id}/cancel",
    tags = ["Orders"],
    params(
        ("id" = Uuid, Path, description = "Order ID to cancel")
    ),
    request_body = CancelOrderReq,
    responses(
        (status = 200, description = "Order cancelled", body = StdResponse<Order, String>),
        (status = 422, description = "Order already terminal or reason missing")
    )
)]
async fn cancel_order(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<CancelOrderReq>,
) -> Result<impl IntoResponse, AppError> {
    let order = state.lifecycle.cancel(id, &payload.reason).await?;

    Ok(StdResponse {
        data: Some(order),
        message: Some("Order cancelled successfully"),
    })
}

#[derive(Serialize, ToSchema)]
pub struct RemoveDriverRes {
    pub order: Order,
    pub cancelled_assignment: Option<DeliveryAssignment>,
}

/// Detach the driver from an order.
#[utoipa::path(
    delete,
    path = "/orders/{id}/driver",
    tags = ["Orders"],
    params(
        ("id" = Uuid, Path, description = "Order ID to release")
    ),
    responses(
        (status = 200, description = "Driver removed", body = StdResponse<RemoveDriverRes, String>),
        (status = 409, description = "Order has no driver")
    )
)]
async fn remove_driver(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let (order, cancelled_assignment) = state.coordinator.unassign(id).await?;

    Ok(StdResponse {
        data: Some(RemoveDriverRes {
            order,
            cancelled_assignment,
        }),
        message: Some("Driver removed successfully"),
    })
}
