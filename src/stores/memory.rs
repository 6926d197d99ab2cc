use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{AssignmentStatus, DeliveryAssignment, Earning, NewOrder, Order, OrderStatus};

use super::{
    AssignmentFilter, ClaimWrite, DeliveryStep, DeliveryStore, OrderFilter, OrderPrecondition,
    ReleaseWrite, StatusWrite, StoreError, StoreResult,
};

#[derive(Default)]
struct Tables {
    orders: HashMap<Uuid, Order>,
    assignments: HashMap<Uuid, DeliveryAssignment>,
    earnings: Vec<Earning>,
    clock: Option<DateTime<Utc>>,
}

impl Tables {
    /// Wall clock, nudged forward so `updated_at` strictly increases across writes.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let now = match self.clock {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.clock = Some(now);
        now
    }

    fn order(&self, id: Uuid) -> StoreResult<&Order> {
        self.orders.get(&id).ok_or(StoreError::NotFound("order"))
    }

    fn order_mut(&mut self, id: Uuid) -> StoreResult<&mut Order> {
        self.orders.get_mut(&id).ok_or(StoreError::NotFound("order"))
    }

    fn assignment_mut(&mut self, id: Uuid) -> StoreResult<&mut DeliveryAssignment> {
        self.assignments
            .get_mut(&id)
            .ok_or(StoreError::NotFound("assignment"))
    }

    fn active_assignment_id(&self, order_id: Uuid) -> Option<Uuid> {
        self.assignments
            .values()
            .find(|a| a.order_id == order_id && a.status.is_active())
            .map(|a| a.id)
    }

    fn write_status(
        &mut self,
        id: Uuid,
        write: &StatusWrite,
        now: DateTime<Utc>,
    ) -> StoreResult<Order> {
        let order = self.order_mut(id)?;
        order.status = write.status;
        order.completed_at = write.completed_at;
        order.cancelled_at = write.cancelled_at;
        order.cancellation_reason = write.cancellation_reason.clone();
        order.revision += 1;
        order.updated_at = now;
        Ok(order.clone())
    }
}

/// In-process store. All tables sit behind one lock, so every call is atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeliveryStore for MemoryStore {
    fn create_order(&self, order: NewOrder) -> BoxFuture<'_, StoreResult<Order>> {
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            let now = tables.tick();
            let order = Order {
                id: Uuid::new_v4(),
                store_id: order.store_id,
                status: OrderStatus::Entrada,
                delivery_type: order.delivery_type,
                assigned_driver_id: None,
                cancellation_reason: None,
                revision: 1,
                created_at: now,
                updated_at: now,
                completed_at: None,
                cancelled_at: None,
            };
            tables.orders.insert(order.id, order.clone());
            Ok(order)
        })
    }

    fn get_order(&self, id: Uuid) -> BoxFuture<'_, StoreResult<Order>> {
        Box::pin(async move { self.tables.lock().await.order(id).cloned() })
    }

    fn query_orders(&self, filter: OrderFilter) -> BoxFuture<'_, StoreResult<Vec<Order>>> {
        Box::pin(async move {
            let tables = self.tables.lock().await;
            let mut orders: Vec<Order> = tables
                .orders
                .values()
                .filter(|o| filter.matches(o))
                .cloned()
                .collect();
            orders.sort_by_key(|o| o.created_at);
            Ok(orders)
        })
    }

    fn update_order_status(
        &self,
        id: Uuid,
        write: StatusWrite,
        expect: OrderPrecondition,
    ) -> BoxFuture<'_, StoreResult<Order>> {
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            expect
                .check(tables.order(id)?)
                .map_err(StoreError::PreconditionFailed)?;
            let now = tables.tick();
            tables.write_status(id, &write, now)
        })
    }

    fn claim_order(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
        fee_cents: i64,
    ) -> BoxFuture<'_, StoreResult<ClaimWrite>> {
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            let current = tables.order(order_id)?.clone();
            if !current.is_claimable() {
                return Ok(ClaimWrite::Rejected { current });
            }

            let now = tables.tick();
            let order = tables.order_mut(order_id)?;
            order.assigned_driver_id = Some(driver_id);
            order.revision += 1;
            order.updated_at = now;
            let order = order.clone();

            let assignment = DeliveryAssignment {
                id: Uuid::new_v4(),
                order_id,
                delivery_driver_id: driver_id,
                store_id: order.store_id,
                status: AssignmentStatus::Assigned,
                fee_cents,
                assigned_at: now,
                picked_up_at: None,
                delivered_at: None,
            };
            tables.assignments.insert(assignment.id, assignment.clone());
            Ok(ClaimWrite::Claimed { order, assignment })
        })
    }

    fn get_assignment(&self, id: Uuid) -> BoxFuture<'_, StoreResult<DeliveryAssignment>> {
        Box::pin(async move {
            self.tables
                .lock()
                .await
                .assignments
                .get(&id)
                .cloned()
                .ok_or(StoreError::NotFound("assignment"))
        })
    }

    fn query_assignments(
        &self,
        filter: AssignmentFilter,
    ) -> BoxFuture<'_, StoreResult<Vec<DeliveryAssignment>>> {
        Box::pin(async move {
            let tables = self.tables.lock().await;
            let mut assignments: Vec<DeliveryAssignment> = tables
                .assignments
                .values()
                .filter(|a| filter.matches(a))
                .cloned()
                .collect();
            assignments.sort_by_key(|a| a.assigned_at);
            Ok(assignments)
        })
    }

    fn commit_step(
        &self,
        step: DeliveryStep,
    ) -> BoxFuture<'_, StoreResult<(Order, DeliveryAssignment)>> {
        Box::pin(async move {
            let mut tables = self.tables.lock().await;

            // Check everything before touching anything.
            step.order_expect
                .check(tables.order(step.order_id)?)
                .map_err(StoreError::PreconditionFailed)?;
            let current = tables
                .assignments
                .get(&step.assignment_id)
                .ok_or(StoreError::NotFound("assignment"))?;
            if current.status != step.assignment_expect || current.order_id != step.order_id {
                return Err(StoreError::PreconditionFailed(format!(
                    "assignment {} is {}, expected {}",
                    current.id, current.status, step.assignment_expect
                )));
            }

            let now = tables.tick();
            let order = tables.write_status(step.order_id, &step.order, now)?;

            let assignment = tables.assignment_mut(step.assignment_id)?;
            assignment.status = step.assignment.status;
            assignment.picked_up_at = step.assignment.picked_up_at;
            assignment.delivered_at = step.assignment.delivered_at;
            let assignment = assignment.clone();

            if let Some(earning) = step.earning {
                tables.earnings.push(Earning {
                    id: Uuid::new_v4(),
                    assignment_id: earning.assignment_id,
                    order_id: earning.order_id,
                    delivery_driver_id: earning.delivery_driver_id,
                    store_id: earning.store_id,
                    amount_cents: earning.amount_cents,
                    created_at: now,
                });
            }

            Ok((order, assignment))
        })
    }

    fn release_order(
        &self,
        order_id: Uuid,
        release: ReleaseWrite,
    ) -> BoxFuture<'_, StoreResult<(Order, Option<DeliveryAssignment>)>> {
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            let current = tables.order(order_id)?;
            if !release.expected_driver.matches(current.assigned_driver_id) {
                return Err(StoreError::PreconditionFailed(format!(
                    "order {} driver is {:?}, expected {:?}",
                    order_id, current.assigned_driver_id, release.expected_driver
                )));
            }
            if let Some((_, expect)) = &release.status {
                expect.check(current).map_err(StoreError::PreconditionFailed)?;
            }

            let now = tables.tick();
            let active = tables.active_assignment_id(order_id);
            let assignment = match active {
                Some(id) => {
                    let assignment = tables.assignment_mut(id)?;
                    assignment.status = AssignmentStatus::Cancelled;
                    Some(assignment.clone())
                }
                None => None,
            };

            tables.order_mut(order_id)?.assigned_driver_id = None;
            let order = match &release.status {
                Some((write, _)) => tables.write_status(order_id, write, now)?,
                None => {
                    let order = tables.order_mut(order_id)?;
                    order.revision += 1;
                    order.updated_at = now;
                    order.clone()
                }
            };

            Ok((order, assignment))
        })
    }

    fn query_earnings(&self, driver_id: Uuid) -> BoxFuture<'_, StoreResult<Vec<Earning>>> {
        Box::pin(async move {
            let tables = self.tables.lock().await;
            Ok(tables
                .earnings
                .iter()
                .filter(|e| e.delivery_driver_id == driver_id)
                .cloned()
                .collect())
        })
    }
}
