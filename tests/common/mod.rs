#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::Result;
use delivery_orderservice::{
    coordinator::AssignmentCoordinator,
    domain::{DeliveryType, NewOrder, Order, OrderStatus},
    lifecycle::OrderLifecycle,
    notifications::{AlertDevice, NotificationDispatcher, PushSink},
    presence::{MemoryPresenceStore, PresenceTracker},
    realtime::LocalBus,
    session::DriverSession,
    state_machine::Actor,
    stores::MemoryStore,
};
use futures::future::BoxFuture;
use uuid::Uuid;

pub const FEE_CENTS: i64 = 500;

/// In-memory store and bus with both service faces on top.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub bus: Arc<LocalBus>,
    pub lifecycle: OrderLifecycle,
    pub coordinator: AssignmentCoordinator,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(LocalBus::new());
        Self {
            lifecycle: OrderLifecycle::new(store.clone(), bus.clone()),
            coordinator: AssignmentCoordinator::new(store.clone(), bus.clone(), FEE_CENTS),
            store,
            bus,
        }
    }

    pub async fn order(&self, store_id: Uuid, delivery_type: DeliveryType) -> Order {
        self.lifecycle
            .create_order(NewOrder {
                store_id,
                delivery_type,
            })
            .await
            .unwrap()
    }

    pub async fn advance(&self, order: &Order, to: OrderStatus) -> Order {
        self.lifecycle
            .advance(order.id, to, None, Actor::Operator)
            .await
            .unwrap()
    }

    /// A delivery order sitting in the claimable pool.
    pub async fn preparing(&self, store_id: Uuid) -> Order {
        let order = self.order(store_id, DeliveryType::Delivery).await;
        self.advance(&order, OrderStatus::EmPreparo).await
    }

    pub async fn session(&self, driver_id: Uuid, store_id: Uuid) -> (DriverSession, Arc<Recorder>) {
        let (dispatcher, recorder) = dispatcher(driver_id).await;
        (
            DriverSession::new(driver_id, store_id, self.coordinator.clone(), dispatcher),
            recorder,
        )
    }
}

/// Captures pushes and alert-loop starts.
#[derive(Default)]
pub struct Recorder {
    pub pushes: Mutex<Vec<String>>,
    pub plays: Mutex<u32>,
    pub stops: Mutex<u32>,
}

impl Recorder {
    pub fn push_count(&self) -> usize {
        self.pushes.lock().unwrap().len()
    }

    pub fn play_count(&self) -> u32 {
        *self.plays.lock().unwrap()
    }
}

impl PushSink for Recorder {
    fn send_push(&self, _driver_id: Uuid, _title: String, body: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.pushes.lock().unwrap().push(body);
            Ok(())
        })
    }
}

impl AlertDevice for Recorder {
    fn play_local_alert(&self) {
        *self.plays.lock().unwrap() += 1;
    }

    fn stop_local_alert(&self) {
        *self.stops.lock().unwrap() += 1;
    }
}

pub async fn online_presence(driver_id: Uuid) -> Arc<PresenceTracker> {
    let presence = PresenceTracker::restore(
        driver_id,
        "phone",
        Arc::new(MemoryPresenceStore::new()),
        None,
    )
    .await
    .unwrap();
    presence.set_online(true).await.unwrap();
    Arc::new(presence)
}

pub async fn dispatcher(driver_id: Uuid) -> (NotificationDispatcher, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let dispatcher = NotificationDispatcher::new(
        online_presence(driver_id).await,
        recorder.clone(),
        recorder.clone(),
    );
    (dispatcher, recorder)
}
