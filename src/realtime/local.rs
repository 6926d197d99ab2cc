use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn};
use uuid::Uuid;

use super::{ChannelHealth, OrderChange, RealtimeChannel, Subscription};

const STORE_CHANNEL_CAPACITY: usize = 256;
const SUBSCRIBER_BUFFER: usize = 64;

struct StoreChannel {
    sender: broadcast::Sender<OrderChange>,
    health: Vec<watch::Sender<ChannelHealth>>,
}

/// In-process bus: one broadcast channel per store.
pub struct LocalBus {
    stores: Mutex<HashMap<Uuid, StoreChannel>>,
    capacity: usize,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_capacity(STORE_CHANNEL_CAPACITY)
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn with_store<T>(&self, store_id: Uuid, f: impl FnOnce(&mut StoreChannel) -> T) -> T {
        let mut stores = self.stores.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let capacity = self.capacity;
        let channel = stores.entry(store_id).or_insert_with(|| StoreChannel {
            sender: broadcast::channel(capacity).0,
            health: Vec::new(),
        });
        f(channel)
    }

    /// Forces every subscription of a store into `health`, as a broker outage would.
    pub fn set_health(&self, store_id: Uuid, health: ChannelHealth) {
        self.with_store(store_id, |channel| {
            channel.health.retain(|tx| !tx.is_closed());
            for tx in &channel.health {
                tx.send_replace(health);
            }
        });
        warn!("Store {} bus health forced to {:?}", store_id, health);
    }

    pub fn subscriber_count(&self, store_id: Uuid) -> usize {
        self.with_store(store_id, |channel| channel.sender.receiver_count())
    }
}

impl RealtimeChannel for LocalBus {
    fn publish(&self, change: OrderChange) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let store_id = change.order.store_id;
            // No receivers is not an error: nobody is watching this store right now.
            let _ = self.with_store(store_id, |channel| channel.sender.send(change));
            Ok(())
        })
    }

    fn subscribe(&self, store_id: Uuid) -> BoxFuture<'_, anyhow::Result<Subscription>> {
        Box::pin(async move {
            let (health_tx, health_rx) = watch::channel(ChannelHealth::Subscribing);
            let mut source = self.with_store(store_id, |channel| {
                channel.health.push(health_tx.clone());
                channel.sender.subscribe()
            });
            let (events_tx, events_rx) = mpsc::channel(SUBSCRIBER_BUFFER);

            health_tx.send_replace(ChannelHealth::Subscribed);
            info!("Subscribed to store {} changes", store_id);

            let task = tokio::spawn(async move {
                loop {
                    match source.recv().await {
                        Ok(change) => {
                            if events_tx.send(change).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("Store {} subscriber lagged by {} changes", store_id, missed);
                            health_tx.send_replace(ChannelHealth::Errored);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            health_tx.send_replace(ChannelHealth::Closed);
                            break;
                        }
                    }
                }
            });

            Ok(Subscription::new(store_id, events_rx, health_rx, task))
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::domain::{DeliveryType, Order, OrderStatus};

    use super::*;

    fn order(store_id: Uuid) -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::new_v4(),
            store_id,
            status: OrderStatus::Entrada,
            delivery_type: DeliveryType::Delivery,
            assigned_driver_id: None,
            cancellation_reason: None,
            revision: 1,
            created_at: now,
            updated_at: now,
            completed_at: None,
            cancelled_at: None,
        }
    }

    #[tokio::test]
    async fn delivers_only_to_the_matching_store() {
        let bus = LocalBus::new();
        let store = Uuid::new_v4();
        let mut mine = bus.subscribe(store).await.unwrap();
        let mut other = bus.subscribe(Uuid::new_v4()).await.unwrap();

        let created = order(store);
        bus.publish(OrderChange::created(created.clone())).await.unwrap();

        assert_eq!(mine.next_change().await.unwrap().order, created);
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), other.next_change())
                .await
                .is_err()
        );
        assert_eq!(mine.current_health(), ChannelHealth::Subscribed);
    }

    #[tokio::test]
    async fn lagging_subscriber_is_marked_errored() {
        let bus = LocalBus::with_capacity(2);
        let store = Uuid::new_v4();
        let mut sub = bus.subscribe(store).await.unwrap();
        let mut health = sub.health();

        // The forwarding task fills its buffer and then falls behind the broadcast ring.
        for _ in 0..(SUBSCRIBER_BUFFER + 8) {
            bus.publish(OrderChange::created(order(store))).await.unwrap();
            tokio::task::yield_now().await;
        }
        sub.next_change().await.unwrap();

        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            health.wait_for(|h| *h == ChannelHealth::Errored),
        )
        .await
        .expect("health should degrade")
        .unwrap();
    }

    #[tokio::test]
    async fn injected_health_reaches_subscribers() {
        let bus = LocalBus::new();
        let store = Uuid::new_v4();
        let sub = bus.subscribe(store).await.unwrap();

        bus.set_health(store, ChannelHealth::TimedOut);
        assert_eq!(sub.current_health(), ChannelHealth::TimedOut);
        assert!(sub.current_health().is_degraded());
    }
}
