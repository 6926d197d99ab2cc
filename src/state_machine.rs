//! Status transition rules for a single order. Pure logic: callers persist the result.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{AssignmentStatus, DeliveryType, Order, OrderStatus};

/// Who is asking for the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Operator,
    Driver(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("cannot move a {delivery_type} order from {from} to {to}")]
    InvalidTransition {
        from: OrderStatus,
        to: OrderStatus,
        delivery_type: DeliveryType,
    },

    #[error("order is already {0}")]
    AlreadyTerminal(OrderStatus),

    #[error("drivers may not set status {0}")]
    ActorNotAllowed(OrderStatus),

    #[error("a cancellation reason is required")]
    MissingCancellationReason,

    #[error("a {delivery_type} order in {status} cannot be claimed")]
    NotClaimable {
        status: OrderStatus,
        delivery_type: DeliveryType,
    },

    #[error("assignment is already {0}")]
    AssignmentClosed(AssignmentStatus),

    #[error("order has a driver attached; only the driver can move it to {0}")]
    DriverAttached(OrderStatus),
}

pub struct OrderStateMachine;

impl OrderStateMachine {
    /// The single allowed successor of `status` along the normal path.
    pub fn next_status(delivery_type: DeliveryType, status: OrderStatus) -> Option<OrderStatus> {
        match (status, delivery_type) {
            (OrderStatus::Entrada, _) => Some(OrderStatus::EmPreparo),
            (OrderStatus::EmPreparo, _) => Some(OrderStatus::AguardaRetirada),
            (OrderStatus::AguardaRetirada, DeliveryType::Delivery) => Some(OrderStatus::EmTransito),
            (OrderStatus::AguardaRetirada, DeliveryType::Pickup | DeliveryType::Table) => {
                Some(OrderStatus::Concluido)
            }
            (OrderStatus::EmTransito, DeliveryType::Delivery) => Some(OrderStatus::Concluido),
            _ => None,
        }
    }

    pub fn can_transition(delivery_type: DeliveryType, from: OrderStatus, to: OrderStatus) -> bool {
        Self::next_status(delivery_type, from) == Some(to)
    }

    /// Applies a normal-path transition. Cancellation goes through [`Self::cancel`].
    pub fn apply(
        order: &Order,
        requested: OrderStatus,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<Order, TransitionError> {
        if order.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal(order.status));
        }
        if let Actor::Driver(_) = actor {
            if !matches!(requested, OrderStatus::EmTransito | OrderStatus::Concluido) {
                return Err(TransitionError::ActorNotAllowed(requested));
            }
        }
        if !Self::can_transition(order.delivery_type, order.status, requested) {
            return Err(TransitionError::InvalidTransition {
                from: order.status,
                to: requested,
                delivery_type: order.delivery_type,
            });
        }
        // Completing a claimed order also closes its assignment; that is the driver's step.
        if actor == Actor::Operator
            && requested == OrderStatus::Concluido
            && order.assigned_driver_id.is_some()
        {
            return Err(TransitionError::DriverAttached(requested));
        }

        let mut next = order.clone();
        next.status = requested;
        if requested == OrderStatus::Concluido {
            next.completed_at = Some(now);
        }
        Ok(next)
    }

    /// One-way cancellation from any non-terminal state.
    pub fn cancel(order: &Order, reason: &str, now: DateTime<Utc>) -> Result<Order, TransitionError> {
        if order.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal(order.status));
        }
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(TransitionError::MissingCancellationReason);
        }

        let mut next = order.clone();
        next.status = OrderStatus::Cancelado;
        next.cancelled_at = Some(now);
        next.cancellation_reason = Some(reason.to_string());
        Ok(next)
    }
}
