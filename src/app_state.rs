use std::sync::Arc;

use crate::{
    coordinator::AssignmentCoordinator, lifecycle::OrderLifecycle, realtime::RealtimeChannel,
    stores::DeliveryStore,
};

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: OrderLifecycle,
    pub coordinator: AssignmentCoordinator,
}

impl AppState {
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        channel: Arc<dyn RealtimeChannel>,
        delivery_fee_cents: i64,
    ) -> Self {
        Self {
            lifecycle: OrderLifecycle::new(store.clone(), channel.clone()),
            coordinator: AssignmentCoordinator::new(store, channel, delivery_fee_cents),
        }
    }
}
