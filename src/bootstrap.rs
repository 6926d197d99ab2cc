//! Process setup shared by the service and the driver agent.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use utoipa::openapi::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    config::{Config, ServerConfig},
    db,
    notifications::{PushSink, TracingPush, WebhookPush},
    realtime::{AmqpBus, LocalBus, RealtimeChannel},
    stores::{DeliveryStore, MemoryStore, PgStore},
};

pub fn init_env() {
    if let Err(err) = dotenvy::dotenv() {
        // A missing .env is normal outside local development.
        if !err.not_found() {
            eprintln!("Failed to load .env: {}", err);
        }
    }
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Picks the store and bus the configuration asks for, running migrations first.
pub async fn build_backends(
    config: &Config,
) -> Result<(Arc<dyn DeliveryStore>, Arc<dyn RealtimeChannel>)> {
    let store: Arc<dyn DeliveryStore> = match &config.database {
        Some(database) => {
            info!("Running migrations...");
            let count = db::run_migrations_blocking(db::MIGRATIONS, &database.url).await?;
            info!("Run {} new migrations successfully", count);
            Arc::new(PgStore::new(db::connect(&database.url).await?))
        }
        None => {
            warn!("DATABASE_URL not set, orders are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let channel: Arc<dyn RealtimeChannel> = match &config.amqp {
        Some(amqp) => Arc::new(
            AmqpBus::connect(&amqp.url, &amqp.exchange, amqp.subscribe_timeout)
                .await
                .context("Failed to set up the realtime bus")?,
        ),
        None => {
            warn!("AMQP_URL not set, realtime changes stay in-process");
            Arc::new(LocalBus::new())
        }
    };

    Ok((store, channel))
}

pub fn build_push(config: &Config) -> Arc<dyn PushSink> {
    match &config.push_webhook_url {
        Some(url) => Arc::new(WebhookPush::new(reqwest::Client::new(), url.clone())),
        None => Arc::new(TracingPush),
    }
}

pub fn swagger_ui(openapi: OpenApi) -> Router {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", openapi)
        .into()
}

pub async fn serve(name: &str, app: Router, server: &ServerConfig) -> Result<()> {
    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("{} listening on {}", name, addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
