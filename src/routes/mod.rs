use utoipa_axum::router::OpenApiRouter;

use crate::app_state::AppState;

pub mod drivers;
pub mod orders;

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    orders::routes_with_openapi().merge(drivers::routes_with_openapi())
}
