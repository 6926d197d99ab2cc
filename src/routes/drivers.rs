use axum::{
    Extension,
    extract::{Path, State},
    response::IntoResponse,
};
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use uuid::Uuid;

use crate::{
    app_error::{AppError, StdResponse},
    app_state::AppState,
    coordinator::ClaimOutcome,
    domain::{AssignmentStatus, DeliveryAssignment, Earning, Order},
    middleware,
};

/// Driver-facing routes. Every handler receives the caller's id from `drivers_authorization`.
pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(utoipa_axum::routes!(get_available_orders))
        .routes(utoipa_axum::routes!(claim_order))
        .routes(utoipa_axum::routes!(accept_assignment))
        .routes(utoipa_axum::routes!(mark_picked_up))
        .routes(utoipa_axum::routes!(mark_delivered))
        .routes(utoipa_axum::routes!(get_my_assignments))
        .routes(utoipa_axum::routes!(get_my_earnings))
        .route_layer(axum::middleware::from_fn(
            middleware::drivers_authorization,
        ))
}

#[derive(Serialize, ToSchema)]
pub struct AssignmentRes {
    pub assignment: DeliveryAssignment,
    pub order: Order,
    /// Assignment status capped by the order's master status.
    pub display_status: AssignmentStatus,
}

impl AssignmentRes {
    fn new(assignment: DeliveryAssignment, order: Order) -> Self {
        let display_status = assignment.status.clamp_to(order.status);
        Self {
            assignment,
            order,
            display_status,
        }
    }
}

/// Fetch the claimable pool of a store.
#[utoipa::path(
    get,
    path = "/stores/{store_id}/available-orders",
    tags = ["Drivers"],
    security(("driverId" = [])),
    params(
        ("store_id" = Uuid, Path, description = "Store whose pool to list")
    ),
    responses(
        (status = 200, description = "List claimable orders", body = StdResponse<Vec<Order>, String>)
    )
)]
async fn get_available_orders(
    Path(store_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let orders = state.coordinator.list_available(store_id).await?;

    Ok(StdResponse {
        data: Some(orders),
        message: Some("Get available orders successfully"),
    })
}

/// Claim an order. Losing the race is reported as `already_claimed`, not as an error.
#[utoipa::path(
    post,
    path = "/orders/{id}/claim",
    tags = ["Drivers"],
    security(("driverId" = [])),
    params(
        ("id" = Uuid, Path, description = "Order ID to claim")
    ),
    responses(
        (status = 200, description = "Claim outcome", body = StdResponse<ClaimOutcome, String>),
        (status = 422, description = "Order is not claimable")
    )
)]
async fn claim_order(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Extension(driver_id): Extension<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state.coordinator.claim(id, driver_id).await?;
    let message = match outcome {
        ClaimOutcome::Claimed { .. } => "Order claimed successfully",
        ClaimOutcome::AlreadyClaimed { .. } => "Order was already claimed by another driver",
    };

    Ok(StdResponse {
        data: Some(outcome),
        message: Some(message),
    })
}

/// Acknowledge an assignment.
#[utoipa::path(
    post,
    path = "/assignments/{id}/accept",
    tags = ["Drivers"],
    security(("driverId" = [])),
    params(
        ("id" = Uuid, Path, description = "Assignment ID to accept")
    ),
    responses(
        (status = 200, description = "Assignment accepted", body = StdResponse<DeliveryAssignment, String>)
    )
)]
async fn accept_assignment(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Extension(driver_id): Extension<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let assignment = state.coordinator.accept(id, driver_id).await?;

    Ok(StdResponse {
        data: Some(assignment),
        message: Some("Assignment accepted successfully"),
    })
}

/// Confirm pickup at the store. The order must be waiting for pickup.
#[utoipa::path(
    post,
    path = "/assignments/{id}/picked-up",
    tags = ["Drivers"],
    security(("driverId" = [])),
    params(
        ("id" = Uuid, Path, description = "Assignment ID")
    ),
    responses(
        (status = 200, description = "Order in transit", body = StdResponse<AssignmentRes, String>),
        (status = 422, description = "Order is not waiting for pickup")
    )
)]
async fn mark_picked_up(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Extension(driver_id): Extension<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let (order, assignment) = state.coordinator.mark_picked_up(id, driver_id).await?;

    Ok(StdResponse {
        data: Some(AssignmentRes::new(assignment, order)),
        message: Some("Order picked up successfully"),
    })
}

/// Confirm delivery. Records the driver's earning.
#[utoipa::path(
    post,
    path = "/assignments/{id}/delivered",
    tags = ["Drivers"],
    security(("driverId" = [])),
    params(
        ("id" = Uuid, Path, description = "Assignment ID")
    ),
    responses(
        (status = 200, description = "Order delivered", body = StdResponse<AssignmentRes, String>),
        (status = 422, description = "Order is not on its way")
    )
)]
async fn mark_delivered(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Extension(driver_id): Extension<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let (order, assignment) = state.coordinator.mark_delivered(id, driver_id).await?;

    Ok(StdResponse {
        data: Some(AssignmentRes::new(assignment, order)),
        message: Some("Order delivered successfully"),
    })
}

/// Fetch the authenticated driver's live assignments.
#[utoipa::path(
    get,
    path = "/drivers/me/assignments",
    tags = ["Drivers"],
    security(("driverId" = [])),
    responses(
        (status = 200, description = "List my assignments", body = StdResponse<Vec<AssignmentRes>, String>)
    )
)]
async fn get_my_assignments(
    State(state): State<AppState>,
    Extension(driver_id): Extension<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let assignments: Vec<AssignmentRes> = state
        .coordinator
        .active_assignments(driver_id)
        .await?
        .into_iter()
        .map(|(assignment, order)| AssignmentRes::new(assignment, order))
        .collect();

    Ok(StdResponse {
        data: Some(assignments),
        message: Some("Get my assignments successfully"),
    })
}

#[derive(Serialize, ToSchema)]
pub struct EarningsRes {
    pub total_cents: i64,
    pub earnings: Vec<Earning>,
}

/// Fetch the authenticated driver's earnings.
#[utoipa::path(
    get,
    path = "/drivers/me/earnings",
    tags = ["Drivers"],
    security(("driverId" = [])),
    responses(
        (status = 200, description = "List my earnings", body = StdResponse<EarningsRes, String>)
    )
)]
async fn get_my_earnings(
    State(state): State<AppState>,
    Extension(driver_id): Extension<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let earnings = state.coordinator.earnings(driver_id).await?;
    let total_cents = earnings.iter().map(|e| e.amount_cents).sum();

    Ok(StdResponse {
        data: Some(EarningsRes {
            total_cents,
            earnings,
        }),
        message: Some("Get my earnings successfully"),
    })
}
