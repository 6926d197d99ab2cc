use axum::{extract::Request, middleware::Next, response::Response};
use uuid::Uuid;

use crate::app_error::AppError;

pub const DRIVER_ID_HEADER: &str = "x-driver-id";

/// Resolves the calling driver from `X-Driver-Id` and exposes it as `Extension<Uuid>`.
pub async fn drivers_authorization(mut req: Request, next: Next) -> Result<Response, AppError> {
    let driver_id = req
        .headers()
        .get(DRIVER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value.trim()).ok())
        .ok_or(AppError::Unauthorized)?;

    req.extensions_mut().insert(driver_id);
    Ok(next.run(req).await)
}
