use anyhow::Result;
use axum::Router;
use delivery_orderservice::{app_state::AppState, bootstrap, config, routes};
use tower_http::trace::TraceLayer;
use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::init_env();
    bootstrap::init_tracing();

    let config = config::load()?;

    tracing::info!("Bootstrapping...");
    let (store, channel) = bootstrap::build_backends(&config).await?;
    let state = AppState::new(store, channel, config.delivery_fee_cents);

    let (router, mut openapi) = routes::routes_with_openapi().split_for_parts();
    openapi.info = utoipa::openapi::InfoBuilder::new()
        .title("Delivery OrderService API")
        .version("1.0.0")
        .build();
    openapi
        .components
        .get_or_insert_with(Default::default)
        .add_security_scheme(
            "driverId",
            SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("X-Driver-Id"))),
        );

    let app = Router::new()
        .merge(router.with_state(state))
        .merge(bootstrap::swagger_ui(openapi))
        .layer(TraceLayer::new_for_http());

    bootstrap::serve("OrderService", app, &config.server).await
}
