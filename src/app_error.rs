use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;
use utoipa::ToSchema;

use crate::error::DeliveryError;

/// Success envelope shared by every handler.
#[derive(Debug, Serialize, ToSchema)]
pub struct StdResponse<T, M> {
    pub data: Option<T>,
    pub message: Option<M>,
}

impl<T: Serialize, M: Serialize> IntoResponse for StdResponse<T, M> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Resource not found")]
    NotFound,

    #[error("{0}")]
    BadRequest(String),

    #[error("Missing or invalid driver identity")]
    Unauthorized,

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidTransition(String),

    /// The store rejected the write for a transient reason; the client may retry.
    #[error("{0}")]
    ServiceUnavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::InvalidTransition(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::Other(err) => {
                error!("Unhandled error: {:#}", err);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        (
            status,
            Json(StdResponse::<(), String> {
                data: None,
                message: Some(message),
            }),
        )
            .into_response()
    }
}

impl From<DeliveryError> for AppError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::InvalidTransition(err) => AppError::InvalidTransition(err.to_string()),
            DeliveryError::PreconditionFailed(message) => AppError::Conflict(message),
            DeliveryError::NotFound(_) => AppError::NotFound,
            DeliveryError::PersistenceFailure(err) => {
                error!("Persistence failure: {:#}", err);
                AppError::ServiceUnavailable("Storage temporarily unavailable, retry".into())
            }
            DeliveryError::ChannelDegraded => {
                AppError::ServiceUnavailable("Realtime channel degraded".into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{domain::OrderStatus, state_machine::TransitionError};

    #[test]
    fn delivery_errors_map_to_statuses() {
        let cases = [
            (
                DeliveryError::InvalidTransition(TransitionError::AlreadyTerminal(
                    OrderStatus::Concluido,
                )),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                DeliveryError::PreconditionFailed("stale".into()),
                StatusCode::CONFLICT,
            ),
            (DeliveryError::NotFound("order"), StatusCode::NOT_FOUND),
            (
                DeliveryError::PersistenceFailure(anyhow::anyhow!("pool timeout")),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).into_response().status(), status);
        }
    }
}
