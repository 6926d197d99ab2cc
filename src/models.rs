use anyhow::Context;
use chrono::{DateTime, Utc};
use diesel::{
    Selectable,
    prelude::{Identifiable, Insertable, Queryable},
};
use uuid::Uuid;

use crate::domain::{DeliveryAssignment, Earning, Order};

// Orders

#[derive(Queryable, Selectable, Identifiable, Debug)]
#[diesel(table_name = crate::schema::orders)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OrderEntity {
    pub id: Uuid,
    pub store_id: Uuid,
    pub status: String,
    pub delivery_type: String,
    pub assigned_driver_id: Option<Uuid>,
    pub cancellation_reason: Option<String>,
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::orders)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreateOrderEntity {
    pub store_id: Uuid,
    pub status: String,
    pub delivery_type: String,
}

impl TryFrom<OrderEntity> for Order {
    type Error = anyhow::Error;

    fn try_from(row: OrderEntity) -> Result<Self, Self::Error> {
        Ok(Order {
            id: row.id,
            store_id: row.store_id,
            status: row
                .status
                .parse()
                .with_context(|| format!("Order #{} has a corrupt status", row.id))?,
            delivery_type: row
                .delivery_type
                .parse()
                .with_context(|| format!("Order #{} has a corrupt delivery type", row.id))?,
            assigned_driver_id: row.assigned_driver_id,
            cancellation_reason: row.cancellation_reason,
            revision: row.revision,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
            cancelled_at: row.cancelled_at,
        })
    }
}

// Delivery assignments

#[derive(Queryable, Selectable, Identifiable, Debug)]
#[diesel(table_name = crate::schema::delivery_assignments)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct AssignmentEntity {
    pub id: Uuid,
    pub order_id: Uuid,
    pub delivery_driver_id: Uuid,
    pub store_id: Uuid,
    pub status: String,
    pub fee_cents: i64,
    pub assigned_at: DateTime<Utc>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::delivery_assignments)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreateAssignmentEntity {
    pub order_id: Uuid,
    pub delivery_driver_id: Uuid,
    pub store_id: Uuid,
    pub status: String,
    pub fee_cents: i64,
}

impl TryFrom<AssignmentEntity> for DeliveryAssignment {
    type Error = anyhow::Error;

    fn try_from(row: AssignmentEntity) -> Result<Self, Self::Error> {
        Ok(DeliveryAssignment {
            id: row.id,
            order_id: row.order_id,
            delivery_driver_id: row.delivery_driver_id,
            store_id: row.store_id,
            status: row
                .status
                .parse()
                .with_context(|| format!("Assignment {} has a corrupt status", row.id))?,
            fee_cents: row.fee_cents,
            assigned_at: row.assigned_at,
            picked_up_at: row.picked_up_at,
            delivered_at: row.delivered_at,
        })
    }
}

// Earnings

#[derive(Queryable, Selectable, Identifiable, Debug)]
#[diesel(table_name = crate::schema::driver_earnings)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct EarningEntity {
    pub id: Uuid,
    pub assignment_id: Uuid,
    pub order_id: Uuid,
    pub delivery_driver_id: Uuid,
    pub store_id: Uuid,
    pub amount_cents: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::driver_earnings)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreateEarningEntity {
    pub assignment_id: Uuid,
    pub order_id: Uuid,
    pub delivery_driver_id: Uuid,
    pub store_id: Uuid,
    pub amount_cents: i64,
}

impl From<EarningEntity> for Earning {
    fn from(row: EarningEntity) -> Self {
        Earning {
            id: row.id,
            assignment_id: row.assignment_id,
            order_id: row.order_id,
            delivery_driver_id: row.delivery_driver_id,
            store_id: row.store_id,
            amount_cents: row.amount_cents,
            created_at: row.created_at,
        }
    }
}
