use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Master status of an order. Every per-role view converges to this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Received, not yet being prepared.
    Entrada,
    /// Being prepared by the store.
    EmPreparo,
    /// Ready for pickup or hand-off to a driver.
    AguardaRetirada,
    /// Out for delivery. Delivery orders only.
    EmTransito,
    Concluido,
    Cancelado,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Entrada => "entrada",
            OrderStatus::EmPreparo => "em_preparo",
            OrderStatus::AguardaRetirada => "aguarda_retirada",
            OrderStatus::EmTransito => "em_transito",
            OrderStatus::Concluido => "concluido",
            OrderStatus::Cancelado => "cancelado",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Concluido | OrderStatus::Cancelado)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entrada" => Ok(OrderStatus::Entrada),
            "em_preparo" => Ok(OrderStatus::EmPreparo),
            "aguarda_retirada" => Ok(OrderStatus::AguardaRetirada),
            "em_transito" => Ok(OrderStatus::EmTransito),
            "concluido" => Ok(OrderStatus::Concluido),
            "cancelado" => Ok(OrderStatus::Cancelado),
            other => Err(UnknownVariant::new("order status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryType {
    Delivery,
    Pickup,
    Table,
}

impl DeliveryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryType::Delivery => "delivery",
            DeliveryType::Pickup => "pickup",
            DeliveryType::Table => "table",
        }
    }
}

impl fmt::Display for DeliveryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delivery" => Ok(DeliveryType::Delivery),
            "pickup" => Ok(DeliveryType::Pickup),
            "table" => Ok(DeliveryType::Table),
            other => Err(UnknownVariant::new("delivery type", other)),
        }
    }
}

/// Driver-side bookkeeping status. Advisory only; `Order::status` wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Assigned,
    Accepted,
    PickedUp,
    Delivered,
    Cancelled,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Assigned => "assigned",
            AssignmentStatus::Accepted => "accepted",
            AssignmentStatus::PickedUp => "picked_up",
            AssignmentStatus::Delivered => "delivered",
            AssignmentStatus::Cancelled => "cancelled",
        }
    }

    /// Still attached to a live order (neither delivered nor cancelled).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            AssignmentStatus::Assigned | AssignmentStatus::Accepted | AssignmentStatus::PickedUp
        )
    }

    /// The furthest assignment status the master order status allows.
    ///
    /// Used to keep a locally cached assignment from running ahead of the order.
    pub fn ceiling_for(order_status: OrderStatus) -> AssignmentStatus {
        match order_status {
            OrderStatus::Entrada | OrderStatus::EmPreparo | OrderStatus::AguardaRetirada => {
                AssignmentStatus::Accepted
            }
            OrderStatus::EmTransito => AssignmentStatus::PickedUp,
            OrderStatus::Concluido => AssignmentStatus::Delivered,
            OrderStatus::Cancelado => AssignmentStatus::Cancelled,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            AssignmentStatus::Assigned => 0,
            AssignmentStatus::Accepted => 1,
            AssignmentStatus::PickedUp => 2,
            AssignmentStatus::Delivered => 3,
            AssignmentStatus::Cancelled => 4,
        }
    }

    /// Clamps `self` so it never reports progress the order has not made.
    pub fn clamp_to(self, order_status: OrderStatus) -> AssignmentStatus {
        if order_status == OrderStatus::Cancelado {
            return AssignmentStatus::Cancelled;
        }
        let ceiling = Self::ceiling_for(order_status);
        if self == AssignmentStatus::Cancelled || self.rank() > ceiling.rank() {
            ceiling
        } else {
            self
        }
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssignmentStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assigned" => Ok(AssignmentStatus::Assigned),
            "accepted" => Ok(AssignmentStatus::Accepted),
            "picked_up" => Ok(AssignmentStatus::PickedUp),
            "delivered" => Ok(AssignmentStatus::Delivered),
            "cancelled" => Ok(AssignmentStatus::Cancelled),
            other => Err(UnknownVariant::new("assignment status", other)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Full order row. Events and poll results always carry one of these whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Order {
    pub id: Uuid,
    pub store_id: Uuid,
    pub status: OrderStatus,
    pub delivery_type: DeliveryType,
    pub assigned_driver_id: Option<Uuid>,
    pub cancellation_reason: Option<String>,
    /// Incremented by the store on every write.
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Whether a driver may claim this order right now.
    pub fn is_claimable(&self) -> bool {
        self.delivery_type == DeliveryType::Delivery
            && self.status == OrderStatus::EmPreparo
            && self.assigned_driver_id.is_none()
    }

    pub fn is_assigned_to(&self, driver_id: Uuid) -> bool {
        self.assigned_driver_id == Some(driver_id)
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct NewOrder {
    pub store_id: Uuid,
    pub delivery_type: DeliveryType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DeliveryAssignment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub delivery_driver_id: Uuid,
    pub store_id: Uuid,
    pub status: AssignmentStatus,
    /// Payout rule captured when the order was claimed.
    pub fee_cents: i64,
    pub assigned_at: DateTime<Utc>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Immutable payout record written when a delivery completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Earning {
    pub id: Uuid,
    pub assignment_id: Uuid,
    pub order_id: Uuid,
    pub delivery_driver_id: Uuid,
    pub store_id: Uuid,
    pub amount_cents: i64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_parse_back() {
        for status in [
            OrderStatus::Entrada,
            OrderStatus::EmPreparo,
            OrderStatus::AguardaRetirada,
            OrderStatus::EmTransito,
            OrderStatus::Concluido,
            OrderStatus::Cancelado,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
        assert!("shipped".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn assignment_never_runs_ahead_of_order() {
        assert_eq!(
            AssignmentStatus::PickedUp.clamp_to(OrderStatus::EmPreparo),
            AssignmentStatus::Accepted
        );
        assert_eq!(
            AssignmentStatus::Assigned.clamp_to(OrderStatus::EmTransito),
            AssignmentStatus::Assigned
        );
        assert_eq!(
            AssignmentStatus::PickedUp.clamp_to(OrderStatus::Cancelado),
            AssignmentStatus::Cancelled
        );
    }
}
