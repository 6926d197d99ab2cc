//! Store-operator side of the order lifecycle.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::{
    domain::{NewOrder, Order, OrderStatus},
    error::{DeliveryError, Result},
    realtime::{OrderChange, RealtimeChannel, publish_or_warn},
    state_machine::{Actor, OrderStateMachine},
    stores::{DeliveryStore, DriverMatch, OrderFilter, OrderPrecondition, ReleaseWrite, StatusWrite},
};

#[derive(Clone)]
pub struct OrderLifecycle {
    store: Arc<dyn DeliveryStore>,
    channel: Arc<dyn RealtimeChannel>,
}

impl OrderLifecycle {
    pub fn new(store: Arc<dyn DeliveryStore>, channel: Arc<dyn RealtimeChannel>) -> Self {
        Self { store, channel }
    }

    pub async fn create_order(&self, order: NewOrder) -> Result<Order> {
        let order = self.store.create_order(order).await?;
        info!(
            "Order #{} created for store {} ({})",
            order.id, order.store_id, order.delivery_type
        );
        publish_or_warn(self.channel.as_ref(), OrderChange::created(order.clone())).await;
        Ok(order)
    }

    pub async fn get_order(&self, id: Uuid) -> Result<Order> {
        Ok(self.store.get_order(id).await?)
    }

    pub async fn list_orders(&self, store_id: Uuid) -> Result<Vec<Order>> {
        Ok(self
            .store
            .query_orders(OrderFilter {
                store_id: Some(store_id),
                ..Default::default()
            })
            .await?)
    }

    /// Moves the order one step along its graph.
    ///
    /// The write is compare-and-set on the status that was read, so a concurrent writer
    /// turns into `PreconditionFailed` instead of a silent overwrite. `expected` lets the
    /// caller pin the status it was looking at when it made the request. The driver read is
    /// pinned too, so a claim landing in between cannot be completed over.
    pub async fn advance(
        &self,
        order_id: Uuid,
        requested: OrderStatus,
        expected: Option<OrderStatus>,
        actor: Actor,
    ) -> Result<Order> {
        let order = self.store.get_order(order_id).await?;
        if let Some(expected) = expected.filter(|s| *s != order.status) {
            return Err(DeliveryError::PreconditionFailed(format!(
                "order {} is {}, expected {}",
                order_id, order.status, expected
            )));
        }

        let next = OrderStateMachine::apply(&order, requested, actor, Utc::now())?;
        let updated = self
            .store
            .update_order_status(
                order_id,
                StatusWrite::from(&next),
                OrderPrecondition::status(order.status)
                    .with_driver(DriverMatch::pinned(order.assigned_driver_id)),
            )
            .await?;

        info!(
            "Order #{} moved from {} to {}",
            order_id, order.status, updated.status
        );
        publish_or_warn(
            self.channel.as_ref(),
            OrderChange::updated(updated.clone(), order.status),
        )
        .await;
        Ok(updated)
    }

    /// Cancels the order and releases any driver in the same write.
    pub async fn cancel(&self, order_id: Uuid, reason: &str) -> Result<Order> {
        let order = self.store.get_order(order_id).await?;
        let next = OrderStateMachine::cancel(&order, reason, Utc::now())?;
        let expected_driver = DriverMatch::pinned(order.assigned_driver_id);

        let (cancelled, assignment) = self
            .store
            .release_order(
                order_id,
                ReleaseWrite {
                    expected_driver,
                    status: Some((StatusWrite::from(&next), OrderPrecondition::status(order.status))),
                },
            )
            .await?;

        info!(
            "Order #{} cancelled from {}{}",
            order_id,
            order.status,
            if assignment.is_some() { ", driver released" } else { "" }
        );
        publish_or_warn(
            self.channel.as_ref(),
            OrderChange::updated(cancelled.clone(), order.status),
        )
        .await;
        Ok(cancelled)
    }
}
