//! Customer-facing view of a single order.

use tokio::{sync::watch, task::JoinHandle};
use tracing::debug;
use uuid::Uuid;

use crate::{
    domain::{Order, OrderStatus},
    realtime::Subscription,
};

/// Follows one order's master status. The highest revision seen wins.
pub struct OrderTracker {
    order_id: Uuid,
    current: watch::Sender<Option<Order>>,
}

impl OrderTracker {
    pub fn new(order_id: Uuid) -> Self {
        Self {
            order_id,
            current: watch::channel(None).0,
        }
    }

    /// Starts from a row fetched from the store.
    pub fn seeded(order: Order) -> Self {
        Self {
            order_id: order.id,
            current: watch::channel(Some(order)).0,
        }
    }

    pub fn order_id(&self) -> Uuid {
        self.order_id
    }

    /// Returns whether the row replaced what the tracker held.
    pub fn apply(&self, order: Order) -> bool {
        if order.id != self.order_id {
            return false;
        }
        self.current.send_if_modified(|current| match current {
            Some(held) if held.revision >= order.revision => false,
            _ => {
                *current = Some(order);
                true
            }
        })
    }

    pub fn status(&self) -> Option<OrderStatus> {
        self.current.borrow().as_ref().map(|o| o.status)
    }

    pub fn order(&self) -> Option<Order> {
        self.current.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<Order>> {
        self.current.subscribe()
    }

    /// Feeds the tracker from a store subscription until the order is terminal or the
    /// subscription ends.
    pub fn follow(self, mut subscription: Subscription) -> JoinHandle<Self> {
        tokio::spawn(async move {
            while let Some(change) = subscription.next_change().await {
                if self.apply(change.order) {
                    debug!("Order #{} now {:?}", self.order_id, self.status());
                }
                if self.status().is_some_and(|s| s.is_terminal()) {
                    break;
                }
            }
            subscription.unsubscribe();
            self
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::domain::DeliveryType;

    fn order(revision: i64, status: OrderStatus) -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::nil(),
            store_id: Uuid::nil(),
            status,
            delivery_type: DeliveryType::Delivery,
            assigned_driver_id: None,
            cancellation_reason: None,
            revision,
            created_at: now,
            updated_at: now,
            completed_at: None,
            cancelled_at: None,
        }
    }

    #[test]
    fn keeps_highest_revision() {
        let tracker = OrderTracker::new(Uuid::nil());
        assert!(tracker.apply(order(2, OrderStatus::EmPreparo)));
        assert!(!tracker.apply(order(1, OrderStatus::Entrada)));
        assert!(!tracker.apply(order(2, OrderStatus::EmPreparo)));
        assert!(tracker.apply(order(3, OrderStatus::AguardaRetirada)));
        assert_eq!(tracker.status(), Some(OrderStatus::AguardaRetirada));
    }

    #[test]
    fn ignores_other_orders() {
        let tracker = OrderTracker::new(Uuid::new_v4());
        assert!(!tracker.apply(order(1, OrderStatus::Entrada)));
        assert_eq!(tracker.status(), None);
    }
}
