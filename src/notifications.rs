//! Turns "order became available" and "my order changed" facts into driver alerts.

use std::{
    collections::HashSet,
    sync::Arc,
};

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    domain::{Order, OrderStatus},
    presence::{Presence, PresenceTracker},
};

pub trait PushSink: Send + Sync {
    fn send_push(&self, driver_id: Uuid, title: String, body: String)
    -> BoxFuture<'_, Result<()>>;
}

/// Device-local sound loop. Best-effort, never fails.
pub trait AlertDevice: Send + Sync {
    fn play_local_alert(&self);

    fn stop_local_alert(&self);
}

#[derive(Serialize)]
struct PushPayload {
    driver_id: Uuid,
    title: String,
    body: String,
}

/// Posts push notifications to an HTTP gateway.
pub struct WebhookPush {
    client: Client,
    url: String,
}

impl WebhookPush {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

impl PushSink for WebhookPush {
    fn send_push(
        &self,
        driver_id: Uuid,
        title: String,
        body: String,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.client
                .post(&self.url)
                .json(&PushPayload {
                    driver_id,
                    title,
                    body,
                })
                .send()
                .await
                .context("Push gateway unreachable")?
                .error_for_status()
                .context("Push gateway rejected notification")?;
            Ok(())
        })
    }
}

/// Push sink for deployments without a gateway: logs instead.
pub struct TracingPush;

impl PushSink for TracingPush {
    fn send_push(
        &self,
        driver_id: Uuid,
        title: String,
        body: String,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            info!("Push to driver {}: {} - {}", driver_id, title, body);
            Ok(())
        })
    }
}

/// Alert device for headless sessions.
pub struct HeadlessAlert;

impl AlertDevice for HeadlessAlert {
    fn play_local_alert(&self) {
        info!("Alert loop started");
    }

    fn stop_local_alert(&self) {
        info!("Alert loop stopped");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertOutcome {
    Alerted,
    /// Already alerted for this order reaching this status.
    Duplicate,
    DriverOffline,
}

/// At most one alert per (order, status) for one driver.
pub struct NotificationDispatcher {
    driver_id: Uuid,
    presence: Arc<PresenceTracker>,
    push: Arc<dyn PushSink>,
    alert: Arc<dyn AlertDevice>,
    notified: HashSet<(Uuid, OrderStatus)>,
    ringing: HashSet<Uuid>,
}

impl NotificationDispatcher {
    pub fn new(
        presence: Arc<PresenceTracker>,
        push: Arc<dyn PushSink>,
        alert: Arc<dyn AlertDevice>,
    ) -> Self {
        Self {
            driver_id: presence.driver_id(),
            presence,
            push,
            alert,
            notified: HashSet::new(),
            ringing: HashSet::new(),
        }
    }

    pub fn is_ringing(&self, order_id: Uuid) -> bool {
        self.ringing.contains(&order_id)
    }

    pub fn ringing_count(&self) -> usize {
        self.ringing.len()
    }

    /// Number of (order, status) pairs already alerted on.
    pub fn notified_count(&self) -> usize {
        self.notified.len()
    }

    pub async fn notify_available(&mut self, order: &Order) -> AlertOutcome {
        if !self.presence.is_online() {
            debug!("Driver {} offline, not alerting for Order #{}", self.driver_id, order.id);
            return AlertOutcome::DriverOffline;
        }
        if !self.notified.insert((order.id, order.status)) {
            return AlertOutcome::Duplicate;
        }

        if self.ringing.is_empty() {
            self.alert.play_local_alert();
        }
        self.ringing.insert(order.id);
        self.push(
            "New order available".to_string(),
            format!("Order #{} is ready to be claimed", order.id),
        )
        .await;
        info!("Alerted driver {} about Order #{}", self.driver_id, order.id);
        AlertOutcome::Alerted
    }

    /// Push-only notice that one of the driver's own orders changed status.
    pub async fn notify_status_changed(&mut self, order: &Order) -> AlertOutcome {
        if !self.presence.is_online() {
            return AlertOutcome::DriverOffline;
        }
        if !self.notified.insert((order.id, order.status)) {
            return AlertOutcome::Duplicate;
        }

        let body = match order.status {
            OrderStatus::AguardaRetirada => format!("Order #{} is ready for pickup", order.id),
            OrderStatus::Cancelado => format!("Order #{} was cancelled", order.id),
            status => format!("Order #{} is now {}", order.id, status),
        };
        self.push("Order updated".to_string(), body).await;
        AlertOutcome::Alerted
    }

    /// Stops the loop for an order that was opened or left the available list.
    pub fn dismiss(&mut self, order_id: Uuid) -> bool {
        if !self.ringing.remove(&order_id) {
            return false;
        }
        if self.ringing.is_empty() {
            self.alert.stop_local_alert();
        }
        true
    }

    /// Drops dedupe state for an order this driver no longer needs to hear about.
    pub fn forget(&mut self, order_id: Uuid) {
        self.dismiss(order_id);
        self.notified.retain(|(id, _)| *id != order_id);
    }

    pub fn on_presence_changed(&mut self, presence: &Presence) {
        if !presence.online && !self.ringing.is_empty() {
            self.ringing.clear();
            self.alert.stop_local_alert();
        }
    }

    async fn push(&self, title: String, body: String) {
        if let Err(err) = self.push.send_push(self.driver_id, title, body).await {
            warn!("Failed to push to driver {}: {:#}", self.driver_id, err);
        }
    }
}
