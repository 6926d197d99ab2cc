//! Claimable-order pool and driver-side transitions.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    domain::{AssignmentStatus, DeliveryAssignment, Earning, Order, OrderStatus},
    error::{DeliveryError, Result},
    realtime::{OrderChange, RealtimeChannel, publish_or_warn},
    state_machine::{Actor, OrderStateMachine, TransitionError},
    stores::{
        AssignmentFilter, AssignmentWrite, ClaimWrite, DeliveryStep, DeliveryStore, DriverMatch,
        NewEarning, OrderFilter, OrderPrecondition, ReleaseWrite, StatusWrite,
    },
};

/// A lost race is a normal result, not an error.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClaimOutcome {
    Claimed {
        order: Order,
        assignment: DeliveryAssignment,
    },
    AlreadyClaimed {
        /// The order as the winning write left it.
        order: Order,
    },
}

#[derive(Clone)]
pub struct AssignmentCoordinator {
    store: Arc<dyn DeliveryStore>,
    channel: Arc<dyn RealtimeChannel>,
    fee_cents: i64,
}

impl AssignmentCoordinator {
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        channel: Arc<dyn RealtimeChannel>,
        fee_cents: i64,
    ) -> Self {
        Self {
            store,
            channel,
            fee_cents,
        }
    }

    pub fn store(&self) -> &Arc<dyn DeliveryStore> {
        &self.store
    }

    pub async fn list_available(&self, store_id: Uuid) -> Result<Vec<Order>> {
        Ok(self.store.query_orders(OrderFilter::available(store_id)).await?)
    }

    /// The driver's live assignments, each paired with its order's current row. Orders that
    /// already reached a terminal status are left out.
    pub async fn active_assignments(
        &self,
        driver_id: Uuid,
    ) -> Result<Vec<(DeliveryAssignment, Order)>> {
        let assignments = self
            .store
            .query_assignments(AssignmentFilter::active_for_driver(driver_id))
            .await?;

        let mut pairs = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let order = self.store.get_order(assignment.order_id).await?;
            if order.status.is_terminal() {
                warn!(
                    "Assignment {} is still {} on Order #{} ({})",
                    assignment.id, assignment.status, order.id, order.status
                );
                continue;
            }
            pairs.push((assignment, order));
        }
        Ok(pairs)
    }

    pub async fn earnings(&self, driver_id: Uuid) -> Result<Vec<Earning>> {
        Ok(self.store.query_earnings(driver_id).await?)
    }

    /// Attaches `driver_id` to the order through one conditional write. Never retried.
    pub async fn claim(&self, order_id: Uuid, driver_id: Uuid) -> Result<ClaimOutcome> {
        match self
            .store
            .claim_order(order_id, driver_id, self.fee_cents)
            .await?
        {
            ClaimWrite::Claimed { order, assignment } => {
                info!("Order #{} claimed by driver {}", order.id, driver_id);
                publish_or_warn(
                    self.channel.as_ref(),
                    OrderChange::updated(order.clone(), OrderStatus::EmPreparo),
                )
                .await;
                Ok(ClaimOutcome::Claimed { order, assignment })
            }
            ClaimWrite::Rejected { current } => match current.assigned_driver_id {
                Some(owner) if owner == driver_id => {
                    // Repeated tap by the winner: hand back what it already holds.
                    let assignment = self.active_assignment_of(order_id, driver_id).await?;
                    Ok(ClaimOutcome::Claimed {
                        order: current,
                        assignment,
                    })
                }
                Some(_) => {
                    info!("Driver {} lost the race for Order #{}", driver_id, order_id);
                    Ok(ClaimOutcome::AlreadyClaimed { order: current })
                }
                None => Err(TransitionError::NotClaimable {
                    status: current.status,
                    delivery_type: current.delivery_type,
                }
                .into()),
            },
        }
    }

    /// Driver acknowledges the assignment. The order status is untouched.
    pub async fn accept(&self, assignment_id: Uuid, driver_id: Uuid) -> Result<DeliveryAssignment> {
        let assignment = self.owned_assignment(assignment_id, driver_id).await?;
        if assignment.status != AssignmentStatus::Assigned {
            return Err(TransitionError::AssignmentClosed(assignment.status).into());
        }
        let order = self.store.get_order(assignment.order_id).await?;
        if order.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal(order.status).into());
        }

        let (order, assignment) = self
            .store
            .commit_step(DeliveryStep {
                order_id: order.id,
                order: StatusWrite::from(&order),
                order_expect: OrderPrecondition::status(order.status)
                    .with_driver(DriverMatch::Driver(driver_id)),
                assignment_id,
                assignment: AssignmentWrite {
                    status: AssignmentStatus::Accepted,
                    ..AssignmentWrite::from(&assignment)
                },
                assignment_expect: AssignmentStatus::Assigned,
                earning: None,
            })
            .await?;

        info!("Driver {} accepted Order #{}", driver_id, order.id);
        let previous = order.status;
        publish_or_warn(self.channel.as_ref(), OrderChange::updated(order, previous)).await;
        Ok(assignment)
    }

    /// `aguarda_retirada` -> `em_transito` on the order and `picked_up` on the assignment, as one unit.
    pub async fn mark_picked_up(
        &self,
        assignment_id: Uuid,
        driver_id: Uuid,
    ) -> Result<(Order, DeliveryAssignment)> {
        let assignment = self.owned_active_assignment(assignment_id, driver_id).await?;
        let order = self.store.get_order(assignment.order_id).await?;
        if order.status != OrderStatus::AguardaRetirada {
            return Err(TransitionError::InvalidTransition {
                from: order.status,
                to: OrderStatus::EmTransito,
                delivery_type: order.delivery_type,
            }
            .into());
        }

        let now = Utc::now();
        let next =
            OrderStateMachine::apply(&order, OrderStatus::EmTransito, Actor::Driver(driver_id), now)?;
        let (updated, assignment) = self
            .store
            .commit_step(DeliveryStep {
                order_id: order.id,
                order: StatusWrite::from(&next),
                order_expect: OrderPrecondition::status(OrderStatus::AguardaRetirada)
                    .with_driver(DriverMatch::Driver(driver_id)),
                assignment_id,
                assignment: AssignmentWrite {
                    status: AssignmentStatus::PickedUp,
                    picked_up_at: Some(now),
                    delivered_at: None,
                },
                assignment_expect: assignment.status,
                earning: None,
            })
            .await?;

        info!("Order #{} picked up by driver {}", updated.id, driver_id);
        publish_or_warn(
            self.channel.as_ref(),
            OrderChange::updated(updated.clone(), order.status),
        )
        .await;
        Ok((updated, assignment))
    }

    /// Completes the order and the assignment together and records the driver's earning.
    ///
    /// From `aguarda_retirada` the pick-up step is committed and published first, so every
    /// observer sees the order pass through `em_transito`.
    pub async fn mark_delivered(
        &self,
        assignment_id: Uuid,
        driver_id: Uuid,
    ) -> Result<(Order, DeliveryAssignment)> {
        let assignment = self.owned_active_assignment(assignment_id, driver_id).await?;
        let order = self.store.get_order(assignment.order_id).await?;

        let (order, assignment) = match order.status {
            OrderStatus::EmTransito => (order, assignment),
            OrderStatus::AguardaRetirada => self.mark_picked_up(assignment_id, driver_id).await?,
            from => {
                return Err(TransitionError::InvalidTransition {
                    from,
                    to: OrderStatus::Concluido,
                    delivery_type: order.delivery_type,
                }
                .into());
            }
        };

        let now = Utc::now();
        let done =
            OrderStateMachine::apply(&order, OrderStatus::Concluido, Actor::Driver(driver_id), now)?;
        let (updated, assignment) = self
            .store
            .commit_step(DeliveryStep {
                order_id: order.id,
                order: StatusWrite::from(&done),
                order_expect: OrderPrecondition::status(OrderStatus::EmTransito)
                    .with_driver(DriverMatch::Driver(driver_id)),
                assignment_id,
                assignment: AssignmentWrite {
                    status: AssignmentStatus::Delivered,
                    picked_up_at: assignment.picked_up_at.or(Some(now)),
                    delivered_at: Some(now),
                },
                assignment_expect: assignment.status,
                earning: Some(NewEarning {
                    assignment_id,
                    order_id: order.id,
                    delivery_driver_id: driver_id,
                    store_id: order.store_id,
                    amount_cents: assignment.fee_cents,
                }),
            })
            .await?;

        info!("Order #{} delivered by driver {}", updated.id, driver_id);
        publish_or_warn(
            self.channel.as_ref(),
            OrderChange::updated(updated.clone(), order.status),
        )
        .await;
        Ok((updated, assignment))
    }

    /// Detaches whichever driver holds the order. Re-admits it to the pool if still preparing.
    pub async fn unassign(&self, order_id: Uuid) -> Result<(Order, Option<DeliveryAssignment>)> {
        let order = self.store.get_order(order_id).await?;
        if order.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal(order.status).into());
        }
        let Some(driver_id) = order.assigned_driver_id else {
            return Err(DeliveryError::PreconditionFailed(format!(
                "order {} has no driver",
                order_id
            )));
        };

        let (released, assignment) = self
            .store
            .release_order(
                order_id,
                ReleaseWrite {
                    expected_driver: DriverMatch::Driver(driver_id),
                    status: None,
                },
            )
            .await?;

        info!("Driver {} removed from Order #{}", driver_id, order_id);
        publish_or_warn(
            self.channel.as_ref(),
            OrderChange::updated(released.clone(), order.status),
        )
        .await;
        Ok((released, assignment))
    }

    async fn owned_assignment(
        &self,
        assignment_id: Uuid,
        driver_id: Uuid,
    ) -> Result<DeliveryAssignment> {
        let assignment = self.store.get_assignment(assignment_id).await?;
        if assignment.delivery_driver_id != driver_id {
            return Err(DeliveryError::NotFound("assignment"));
        }
        Ok(assignment)
    }

    async fn owned_active_assignment(
        &self,
        assignment_id: Uuid,
        driver_id: Uuid,
    ) -> Result<DeliveryAssignment> {
        let assignment = self.owned_assignment(assignment_id, driver_id).await?;
        if !assignment.status.is_active() {
            return Err(TransitionError::AssignmentClosed(assignment.status).into());
        }
        Ok(assignment)
    }

    async fn active_assignment_of(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
    ) -> Result<DeliveryAssignment> {
        self.store
            .query_assignments(AssignmentFilter {
                order_id: Some(order_id),
                driver_id: Some(driver_id),
                active_only: true,
                ..Default::default()
            })
            .await?
            .pop()
            .ok_or(DeliveryError::NotFound("assignment"))
    }
}
