//! Per-store change feed carrying full order rows to driver and customer sessions.

pub mod amqp;
pub mod local;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::warn;
use uuid::Uuid;

use crate::domain::{Order, OrderStatus};

pub use amqp::AmqpBus;
pub use local::LocalBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    OrderCreated,
    OrderUpdated,
}

/// Where a change entered the session. Both origins go through identical rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOrigin {
    Bus,
    Poll,
    /// The response to this session's own write.
    Local,
}

/// A full order snapshot. Never a diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderChange {
    pub kind: ChangeKind,
    pub order: Order,
    /// Status before the write, when the writer knew it.
    pub previous_status: Option<OrderStatus>,
    pub origin: ChangeOrigin,
}

impl OrderChange {
    pub fn created(order: Order) -> Self {
        Self {
            kind: ChangeKind::OrderCreated,
            order,
            previous_status: None,
            origin: ChangeOrigin::Bus,
        }
    }

    pub fn updated(order: Order, previous_status: OrderStatus) -> Self {
        Self {
            kind: ChangeKind::OrderUpdated,
            order,
            previous_status: Some(previous_status),
            origin: ChangeOrigin::Bus,
        }
    }

    /// A snapshot fetched by polling; the previous status is whatever the session last saw.
    pub fn polled(order: Order) -> Self {
        Self {
            kind: ChangeKind::OrderUpdated,
            order,
            previous_status: None,
            origin: ChangeOrigin::Poll,
        }
    }

    pub fn local(order: Order) -> Self {
        Self {
            kind: ChangeKind::OrderUpdated,
            order,
            previous_status: None,
            origin: ChangeOrigin::Local,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelHealth {
    Subscribing,
    Subscribed,
    Errored,
    TimedOut,
    Closed,
}

impl ChannelHealth {
    /// Whether polling has to stand in for the bus.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            ChannelHealth::Errored | ChannelHealth::TimedOut | ChannelHealth::Closed
        )
    }
}

/// A live subscription to one store's changes. Dropping it unsubscribes.
pub struct Subscription {
    pub id: Uuid,
    pub store_id: Uuid,
    events: mpsc::Receiver<OrderChange>,
    health: watch::Receiver<ChannelHealth>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(
        store_id: Uuid,
        events: mpsc::Receiver<OrderChange>,
        health: watch::Receiver<ChannelHealth>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            store_id,
            events,
            health,
            task: Some(task),
        }
    }

    /// Next change, or `None` once the channel has closed.
    pub async fn next_change(&mut self) -> Option<OrderChange> {
        self.events.recv().await
    }

    pub fn health(&self) -> watch::Receiver<ChannelHealth> {
        self.health.clone()
    }

    pub fn current_health(&self) -> ChannelHealth {
        *self.health.borrow()
    }

    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.events.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

pub trait RealtimeChannel: Send + Sync {
    fn publish(&self, change: OrderChange) -> BoxFuture<'_, anyhow::Result<()>>;

    fn subscribe(&self, store_id: Uuid) -> BoxFuture<'_, anyhow::Result<Subscription>>;
}

/// Best-effort publish: the write already landed, and polling covers a lost event.
pub async fn publish_or_warn(channel: &dyn RealtimeChannel, change: OrderChange) {
    let order_id = change.order.id;
    if let Err(err) = channel.publish(change).await {
        warn!("Failed to publish change for Order #{}: {:#}", order_id, err);
    }
}
