//! Headless driver session: follows one store's pool and alerts through the push sink.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use delivery_orderservice::{
    bootstrap, config,
    coordinator::AssignmentCoordinator,
    notifications::{HeadlessAlert, NotificationDispatcher},
    poller::SyncHealth,
    presence::{FilePresenceStore, PresenceTracker},
    runtime::{SessionConfig, spawn_session},
    session::DriverSession,
};
use uuid::Uuid;

fn uuid_var(key: &str) -> Result<Uuid> {
    let value = std::env::var(key).with_context(|| format!("{} must be set", key))?;
    Uuid::parse_str(value.trim()).with_context(|| format!("Invalid value for {}: {:?}", key, value))
}

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::init_env();
    bootstrap::init_tracing();

    let config = config::load()?;
    let driver_id = uuid_var("DRIVER_ID")?;
    let store_id = uuid_var("DRIVER_STORE_ID")?;
    let device_id = std::env::var("DRIVER_DEVICE_ID").unwrap_or_else(|_| "agent".to_string());
    let presence_dir =
        PathBuf::from(std::env::var("PRESENCE_DIR").unwrap_or_else(|_| ".presence".to_string()));

    let (store, channel) = bootstrap::build_backends(&config).await?;
    let coordinator =
        AssignmentCoordinator::new(store, channel.clone(), config.delivery_fee_cents);

    let presence = Arc::new(
        PresenceTracker::restore(
            driver_id,
            &device_id,
            Arc::new(FilePresenceStore::new(presence_dir)),
            config.sync.presence_stale_after,
        )
        .await?,
    );
    presence.set_online(true).await?;

    let dispatcher = NotificationDispatcher::new(
        presence.clone(),
        bootstrap::build_push(&config),
        Arc::new(HeadlessAlert),
    );
    let session = DriverSession::new(driver_id, store_id, coordinator, dispatcher);
    let handle = spawn_session(
        session,
        channel,
        presence.watch(),
        SessionConfig {
            poll_interval: config.sync.poll_interval,
            poll_failure_threshold: config.sync.poll_failure_threshold,
            ..Default::default()
        },
    );

    let mut sync = handle.sync_health();
    let heartbeat_every = config
        .sync
        .presence_stale_after
        .map(|stale| stale / 2)
        .unwrap_or(config.sync.poll_interval);
    let mut heartbeat = tokio::time::interval(heartbeat_every);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Ok(()) = sync.changed() => {
                if *sync.borrow_and_update() == SyncHealth::Failing {
                    tracing::error!("Unable to reach the order store; the available list may be stale");
                }
            },
            _ = heartbeat.tick() => {
                if config.sync.presence_stale_after.is_some() {
                    presence.heartbeat().await?;
                }
                tracing::info!("{} orders available", handle.available().await.len());
            },
        }
    }

    presence.set_online(false).await?;
    handle.shutdown().await;
    Ok(())
}
