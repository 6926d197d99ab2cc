//! Durable record of orders, assignments and earnings.
//!
//! Every write that must not interleave with another actor's write is expressed as a single
//! store call carrying its precondition, so implementations can apply it atomically.

pub mod memory;
pub mod postgres;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    AssignmentStatus, DeliveryAssignment, DeliveryType, Earning, NewOrder, Order, OrderStatus,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Expected value of `assigned_driver_id` at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverMatch {
    #[default]
    Any,
    Unassigned,
    Driver(Uuid),
}

impl DriverMatch {
    /// Expects exactly the driver that was read.
    pub fn pinned(assigned: Option<Uuid>) -> Self {
        match assigned {
            Some(driver_id) => DriverMatch::Driver(driver_id),
            None => DriverMatch::Unassigned,
        }
    }

    pub fn matches(&self, assigned: Option<Uuid>) -> bool {
        match self {
            DriverMatch::Any => true,
            DriverMatch::Unassigned => assigned.is_none(),
            DriverMatch::Driver(id) => assigned == Some(*id),
        }
    }
}

/// Compare-and-set guard on an order row.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderPrecondition {
    pub status: Option<OrderStatus>,
    pub driver: DriverMatch,
}

impl OrderPrecondition {
    pub fn status(status: OrderStatus) -> Self {
        Self {
            status: Some(status),
            driver: DriverMatch::Any,
        }
    }

    pub fn with_driver(mut self, driver: DriverMatch) -> Self {
        self.driver = driver;
        self
    }

    /// Returns a description of the mismatch, if any.
    pub fn check(&self, order: &Order) -> Result<(), String> {
        if let Some(expected) = self.status {
            if order.status != expected {
                return Err(format!(
                    "order {} is {}, expected {}",
                    order.id, order.status, expected
                ));
            }
        }
        if !self.driver.matches(order.assigned_driver_id) {
            return Err(format!(
                "order {} driver is {:?}, expected {:?}",
                order.id, order.assigned_driver_id, self.driver
            ));
        }
        Ok(())
    }
}

/// Status-bearing fields of an order, written together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusWrite {
    pub status: OrderStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
}

impl From<&Order> for StatusWrite {
    fn from(order: &Order) -> Self {
        Self {
            status: order.status,
            completed_at: order.completed_at,
            cancelled_at: order.cancelled_at,
            cancellation_reason: order.cancellation_reason.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentWrite {
    pub status: AssignmentStatus,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl From<&DeliveryAssignment> for AssignmentWrite {
    fn from(assignment: &DeliveryAssignment) -> Self {
        Self {
            status: assignment.status,
            picked_up_at: assignment.picked_up_at,
            delivered_at: assignment.delivered_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewEarning {
    pub assignment_id: Uuid,
    pub order_id: Uuid,
    pub delivery_driver_id: Uuid,
    pub store_id: Uuid,
    pub amount_cents: i64,
}

/// A driver-side step: order write, assignment write and optional earning, all or nothing.
#[derive(Debug, Clone)]
pub struct DeliveryStep {
    pub order_id: Uuid,
    pub order: StatusWrite,
    pub order_expect: OrderPrecondition,
    pub assignment_id: Uuid,
    pub assignment: AssignmentWrite,
    pub assignment_expect: AssignmentStatus,
    pub earning: Option<NewEarning>,
}

/// Result of the conditional claim write.
#[derive(Debug, Clone)]
pub enum ClaimWrite {
    Claimed {
        order: Order,
        assignment: DeliveryAssignment,
    },
    /// The precondition did not hold. Carries the row as it is now.
    Rejected { current: Order },
}

#[derive(Debug, Clone)]
pub struct ReleaseWrite {
    pub expected_driver: DriverMatch,
    /// Applied in the same unit as the release (used by cancellation).
    pub status: Option<(StatusWrite, OrderPrecondition)>,
}

#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub store_id: Option<Uuid>,
    pub status: Option<OrderStatus>,
    pub delivery_type: Option<DeliveryType>,
    pub driver: DriverMatch,
}

impl OrderFilter {
    /// The claimable pool for a store.
    pub fn available(store_id: Uuid) -> Self {
        Self {
            store_id: Some(store_id),
            status: Some(OrderStatus::EmPreparo),
            delivery_type: Some(DeliveryType::Delivery),
            driver: DriverMatch::Unassigned,
        }
    }

    pub fn matches(&self, order: &Order) -> bool {
        self.store_id.is_none_or(|id| order.store_id == id)
            && self.status.is_none_or(|s| order.status == s)
            && self.delivery_type.is_none_or(|t| order.delivery_type == t)
            && self.driver.matches(order.assigned_driver_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AssignmentFilter {
    pub order_id: Option<Uuid>,
    pub driver_id: Option<Uuid>,
    pub store_id: Option<Uuid>,
    pub active_only: bool,
}

impl AssignmentFilter {
    pub fn active_for_driver(driver_id: Uuid) -> Self {
        Self {
            driver_id: Some(driver_id),
            active_only: true,
            ..Default::default()
        }
    }

    pub fn matches(&self, assignment: &DeliveryAssignment) -> bool {
        self.order_id.is_none_or(|id| assignment.order_id == id)
            && self.driver_id.is_none_or(|id| assignment.delivery_driver_id == id)
            && self.store_id.is_none_or(|id| assignment.store_id == id)
            && (!self.active_only || assignment.status.is_active())
    }
}

/// Order Store and Assignment Store in one handle, since claim and delivery steps span both.
pub trait DeliveryStore: Send + Sync {
    fn create_order(&self, order: NewOrder) -> BoxFuture<'_, StoreResult<Order>>;

    fn get_order(&self, id: Uuid) -> BoxFuture<'_, StoreResult<Order>>;

    fn query_orders(&self, filter: OrderFilter) -> BoxFuture<'_, StoreResult<Vec<Order>>>;

    /// Writes status fields only if `expect` holds on the current row.
    fn update_order_status(
        &self,
        id: Uuid,
        write: StatusWrite,
        expect: OrderPrecondition,
    ) -> BoxFuture<'_, StoreResult<Order>>;

    /// Sets `assigned_driver_id` only if the order is still claimable, creating the
    /// assignment row in the same unit.
    fn claim_order(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
        fee_cents: i64,
    ) -> BoxFuture<'_, StoreResult<ClaimWrite>>;

    fn get_assignment(&self, id: Uuid) -> BoxFuture<'_, StoreResult<DeliveryAssignment>>;

    fn query_assignments(
        &self,
        filter: AssignmentFilter,
    ) -> BoxFuture<'_, StoreResult<Vec<DeliveryAssignment>>>;

    fn commit_step(
        &self,
        step: DeliveryStep,
    ) -> BoxFuture<'_, StoreResult<(Order, DeliveryAssignment)>>;

    /// Clears the driver and cancels the active assignment, if any.
    fn release_order(
        &self,
        order_id: Uuid,
        release: ReleaseWrite,
    ) -> BoxFuture<'_, StoreResult<(Order, Option<DeliveryAssignment>)>>;

    fn query_earnings(&self, driver_id: Uuid) -> BoxFuture<'_, StoreResult<Vec<Earning>>>;
}
