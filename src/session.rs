//! A driver's local view of one store: the claimable pool and the driver's own assignments.
//!
//! Bus events, poll snapshots and the responses to the driver's own writes all land in
//! [`DriverSession::apply_change`]. Each carries a full row; the highest revision wins and
//! anything at or below the known revision is dropped, so redelivery is harmless.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    coordinator::{AssignmentCoordinator, ClaimOutcome},
    domain::{AssignmentStatus, DeliveryAssignment, Order, OrderStatus},
    error::{DeliveryError, Result},
    notifications::NotificationDispatcher,
    presence::Presence,
    realtime::{ChangeKind, ChangeOrigin, OrderChange},
    stores::AssignmentFilter,
};

/// A claimed order as the driver sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentView {
    pub assignment: DeliveryAssignment,
    pub order: Order,
}

impl AssignmentView {
    /// Assignment status capped by the master order status.
    pub fn display_status(&self) -> AssignmentStatus {
        self.assignment.status.clamp_to(self.order.status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Older than what the session already holds.
    Stale,
    /// Same revision as what the session already holds.
    Duplicate,
    OtherStore,
}

/// What a poll saw at one instant.
#[derive(Debug, Clone, Default)]
pub struct PollSnapshot {
    pub available: Vec<Order>,
    pub assigned: Vec<(DeliveryAssignment, Order)>,
}

pub struct DriverSession {
    driver_id: Uuid,
    store_id: Uuid,
    coordinator: AssignmentCoordinator,
    dispatcher: NotificationDispatcher,
    known: HashMap<Uuid, Order>,
    available: HashMap<Uuid, Order>,
    assignments: HashMap<Uuid, AssignmentView>,
}

impl DriverSession {
    pub fn new(
        driver_id: Uuid,
        store_id: Uuid,
        coordinator: AssignmentCoordinator,
        dispatcher: NotificationDispatcher,
    ) -> Self {
        Self {
            driver_id,
            store_id,
            coordinator,
            dispatcher,
            known: HashMap::new(),
            available: HashMap::new(),
            assignments: HashMap::new(),
        }
    }

    pub fn driver_id(&self) -> Uuid {
        self.driver_id
    }

    pub fn store_id(&self) -> Uuid {
        self.store_id
    }

    pub fn coordinator(&self) -> &AssignmentCoordinator {
        &self.coordinator
    }

    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.dispatcher
    }

    /// Claimable orders, oldest first.
    pub fn available(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.available.values().cloned().collect();
        orders.sort_by_key(|o| (o.created_at, o.id));
        orders
    }

    pub fn is_available(&self, order_id: Uuid) -> bool {
        self.available.contains_key(&order_id)
    }

    pub fn assignments(&self) -> Vec<AssignmentView> {
        let mut views: Vec<AssignmentView> = self.assignments.values().cloned().collect();
        views.sort_by_key(|v| v.assignment.assigned_at);
        views
    }

    pub fn assignment_for(&self, order_id: Uuid) -> Option<&AssignmentView> {
        self.assignments.get(&order_id)
    }

    pub fn known_order(&self, order_id: Uuid) -> Option<&Order> {
        self.known.get(&order_id)
    }

    pub async fn apply_change(&mut self, change: OrderChange) -> ApplyOutcome {
        let origin = change.origin;
        let incoming = change.order;
        if incoming.store_id != self.store_id {
            return ApplyOutcome::OtherStore;
        }

        let previous = self.known.get(&incoming.id);
        if let Some(previous) = previous {
            if incoming.revision < previous.revision {
                debug!(
                    "Dropping stale Order #{} r{} (have r{})",
                    incoming.id, incoming.revision, previous.revision
                );
                return ApplyOutcome::Stale;
            }
            if incoming.revision == previous.revision {
                return ApplyOutcome::Duplicate;
            }
        }
        let previous_status = change
            .previous_status
            .or_else(|| previous.map(|p| p.status));
        self.known.insert(incoming.id, incoming.clone());

        self.update_pool(change.kind, previous_status, &incoming).await;
        self.update_assignment(origin, previous_status, &incoming).await;

        if incoming.status.is_terminal() {
            self.dispatcher.forget(incoming.id);
        }
        ApplyOutcome::Applied
    }

    async fn update_pool(
        &mut self,
        kind: ChangeKind,
        previous_status: Option<OrderStatus>,
        order: &Order,
    ) {
        if order.is_claimable() {
            let newly_available = match kind {
                ChangeKind::OrderCreated => true,
                ChangeKind::OrderUpdated => previous_status != Some(OrderStatus::EmPreparo),
            };
            self.available.insert(order.id, order.clone());
            if newly_available {
                self.dispatcher.notify_available(order).await;
            }
            return;
        }

        if self.available.remove(&order.id).is_some() {
            match order.assigned_driver_id {
                Some(owner) if owner == self.driver_id => {
                    self.dispatcher.dismiss(order.id);
                }
                Some(_) => {
                    info!("Order #{} was claimed by another driver", order.id);
                    self.dispatcher.forget(order.id);
                }
                None => {
                    debug!("Order #{} left the pool as {}", order.id, order.status);
                    self.dispatcher.forget(order.id);
                }
            }
        }
    }

    async fn update_assignment(
        &mut self,
        origin: ChangeOrigin,
        previous_status: Option<OrderStatus>,
        order: &Order,
    ) {
        // The driver's own writes need no notice.
        let notify = origin != ChangeOrigin::Local;

        if !order.is_assigned_to(self.driver_id) || order.status.is_terminal() {
            if let Some(view) = self.assignments.remove(&order.id) {
                info!(
                    "Order #{} left driver {}'s assignments as {}",
                    order.id, self.driver_id, order.status
                );
                if notify && order.status == OrderStatus::Cancelado && view.order.status != order.status
                {
                    self.dispatcher.notify_status_changed(order).await;
                }
            }
            return;
        }

        if let Some(view) = self.assignments.get_mut(&order.id) {
            view.order = order.clone();
        }

        let threshold = matches!(
            order.status,
            OrderStatus::AguardaRetirada | OrderStatus::EmTransito
        );
        let status_changed = previous_status != Some(order.status);
        if notify && threshold && status_changed {
            self.dispatcher.notify_status_changed(order).await;
        }
        if (threshold && status_changed) || !self.assignments.contains_key(&order.id) {
            self.refresh_assignment(order).await;
        }
    }

    /// Re-reads the assignment row so the cached copy cannot drift from the store.
    async fn refresh_assignment(&mut self, order: &Order) {
        let fetched = self
            .coordinator
            .store()
            .query_assignments(AssignmentFilter {
                order_id: Some(order.id),
                driver_id: Some(self.driver_id),
                active_only: true,
                ..Default::default()
            })
            .await;

        match fetched {
            Ok(mut rows) => match rows.pop() {
                Some(assignment) => {
                    self.assignments.insert(
                        order.id,
                        AssignmentView {
                            assignment,
                            order: order.clone(),
                        },
                    );
                }
                None => warn!("Order #{} names this driver but has no live assignment", order.id),
            },
            Err(err) => warn!("Failed to refresh assignment for Order #{}: {}", order.id, err),
        }
    }

    /// Installs an assignment row unless the session already holds a newer order row, or
    /// the row no longer puts the order in this driver's hands.
    fn upsert_assignment(&mut self, assignment: DeliveryAssignment, order: Order) {
        let newest_known = self
            .known
            .get(&order.id)
            .into_iter()
            .chain(self.assignments.get(&order.id).map(|view| &view.order))
            .map(|known| known.revision)
            .max();
        if newest_known.is_some_and(|revision| revision > order.revision) {
            debug!(
                "Ignoring assignment for Order #{} at r{} (have r{:?})",
                order.id, order.revision, newest_known
            );
            return;
        }
        if !assignment.status.is_active()
            || !order.is_assigned_to(self.driver_id)
            || order.status.is_terminal()
        {
            return;
        }
        self.assignments
            .insert(order.id, AssignmentView { assignment, order });
    }

    /// Reconciles against a poll. Orders this session still lists but the poll no longer
    /// returns are re-read individually, since only the full row says why they left.
    pub async fn reconcile(&mut self, snapshot: PollSnapshot) -> Result<()> {
        let polled: HashSet<Uuid> = snapshot.available.iter().map(|o| o.id).collect();
        let assigned: HashSet<Uuid> = snapshot.assigned.iter().map(|(_, o)| o.id).collect();

        for order in snapshot.available {
            self.apply_change(OrderChange::polled(order)).await;
        }
        for (assignment, order) in snapshot.assigned {
            self.apply_change(OrderChange::polled(order.clone())).await;
            self.upsert_assignment(assignment, order);
        }

        let vanished: Vec<Uuid> = self
            .available
            .keys()
            .filter(|id| !polled.contains(*id))
            .chain(self.assignments.keys().filter(|id| !assigned.contains(*id)))
            .copied()
            .collect();
        for order_id in vanished {
            match self.coordinator.store().get_order(order_id).await {
                Ok(order) => {
                    self.apply_change(OrderChange::polled(order)).await;
                }
                Err(crate::stores::StoreError::NotFound(_)) => {
                    self.available.remove(&order_id);
                    self.assignments.remove(&order_id);
                    self.dispatcher.forget(order_id);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// The driver opened the order: stop ringing for it.
    pub fn open_order(&mut self, order_id: Uuid) {
        self.dispatcher.dismiss(order_id);
    }

    pub fn on_presence_changed(&mut self, presence: &Presence) {
        self.dispatcher.on_presence_changed(presence);
    }

    /// Claims through the coordinator and applies the result locally right away.
    ///
    /// A lost race removes the order from the pool without surfacing an error.
    pub async fn claim(&mut self, order_id: Uuid) -> Result<ClaimOutcome> {
        self.dispatcher.dismiss(order_id);
        let outcome = match self.coordinator.claim(order_id, self.driver_id).await {
            Ok(outcome) => outcome,
            Err(err @ DeliveryError::InvalidTransition(_)) => {
                // No longer claimable for some other reason; drop it from the pool.
                if let Ok(current) = self.coordinator.store().get_order(order_id).await {
                    self.apply_change(OrderChange::local(current)).await;
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        match &outcome {
            ClaimOutcome::Claimed { order, assignment } => {
                self.upsert_assignment(assignment.clone(), order.clone());
                self.apply_change(OrderChange::local(order.clone())).await;
            }
            ClaimOutcome::AlreadyClaimed { order } => {
                self.apply_change(OrderChange::local(order.clone())).await;
                self.available.remove(&order_id);
            }
        }
        Ok(outcome)
    }

    pub async fn mark_picked_up(&mut self, order_id: Uuid) -> Result<AssignmentView> {
        let assignment_id = self.assignment_id(order_id)?;
        let (order, assignment) = self
            .coordinator
            .mark_picked_up(assignment_id, self.driver_id)
            .await?;
        self.upsert_assignment(assignment.clone(), order.clone());
        self.apply_change(OrderChange::local(order.clone())).await;
        Ok(AssignmentView { assignment, order })
    }

    pub async fn mark_delivered(&mut self, order_id: Uuid) -> Result<AssignmentView> {
        let assignment_id = self.assignment_id(order_id)?;
        let (order, assignment) = self
            .coordinator
            .mark_delivered(assignment_id, self.driver_id)
            .await?;
        self.apply_change(OrderChange::local(order.clone())).await;
        Ok(AssignmentView { assignment, order })
    }

    fn assignment_id(&self, order_id: Uuid) -> Result<Uuid> {
        self.assignments
            .get(&order_id)
            .map(|view| view.assignment.id)
            .ok_or(DeliveryError::NotFound("assignment"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::{
        domain::DeliveryType,
        notifications::{HeadlessAlert, TracingPush},
        presence::{MemoryPresenceStore, PresenceTracker},
        realtime::LocalBus,
        stores::MemoryStore,
    };

    async fn session(store_id: Uuid) -> DriverSession {
        let driver_id = Uuid::new_v4();
        let presence = PresenceTracker::restore(
            driver_id,
            "phone",
            Arc::new(MemoryPresenceStore::new()),
            None,
        )
        .await
        .unwrap();
        let coordinator = AssignmentCoordinator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(LocalBus::new()),
            500,
        );
        let dispatcher = NotificationDispatcher::new(
            Arc::new(presence),
            Arc::new(TracingPush),
            Arc::new(HeadlessAlert),
        );
        DriverSession::new(driver_id, store_id, coordinator, dispatcher)
    }

    fn order(store_id: Uuid, status: OrderStatus, revision: i64) -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::nil(),
            store_id,
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

    #[tokio::test]
    async fn ignores_other_stores() {
        let store_id = Uuid::new_v4();
        let mut session = session(store_id).await;
        let foreign = order(Uuid::new_v4(), OrderStatus::EmPreparo, 2);
        assert_eq!(
            session.apply_change(OrderChange::polled(foreign)).await,
            ApplyOutcome::OtherStore
        );
        assert!(session.available().is_empty());
    }

    #[tokio::test]
    async fn pool_follows_the_highest_revision() {
        let store_id = Uuid::new_v4();
        let mut session = session(store_id).await;

        let preparing = order(store_id, OrderStatus::EmPreparo, 2);
        session.apply_change(OrderChange::polled(preparing)).await;
        assert!(session.is_available(Uuid::nil()));

        let ready = order(store_id, OrderStatus::AguardaRetirada, 3);
        session.apply_change(OrderChange::polled(ready)).await;
        assert!(!session.is_available(Uuid::nil()));

        let late = order(store_id, OrderStatus::EmPreparo, 2);
        assert_eq!(
            session.apply_change(OrderChange::polled(late)).await,
            ApplyOutcome::Stale
        );
        assert!(!session.is_available(Uuid::nil()));
    }
}
