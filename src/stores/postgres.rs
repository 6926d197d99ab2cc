use anyhow::Context;
use diesel::{
    BoolExpressionMethods, ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper,
};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::{
    db::DbPool,
    domain::{
        AssignmentStatus, DeliveryAssignment, DeliveryType, Earning, NewOrder, Order, OrderStatus,
    },
    models::{
        AssignmentEntity, CreateAssignmentEntity, CreateEarningEntity, CreateOrderEntity,
        EarningEntity, OrderEntity,
    },
    schema::{delivery_assignments, driver_earnings, orders},
};

use super::{
    AssignmentFilter, ClaimWrite, DeliveryStep, DeliveryStore, DriverMatch, OrderFilter,
    OrderPrecondition, ReleaseWrite, StatusWrite, StoreError, StoreResult,
};

const ACTIVE_ASSIGNMENT_STATUSES: [&str; 3] = ["assigned", "accepted", "picked_up"];

impl From<diesel::result::Error> for StoreError {
    fn from(err: diesel::result::Error) -> Self {
        StoreError::Backend(err.into())
    }
}

/// Postgres-backed store. Compound writes run in one transaction with row locks.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(
        &self,
    ) -> StoreResult<diesel_async::pooled_connection::bb8::PooledConnection<'_, AsyncPgConnection>>
    {
        Ok(self
            .pool
            .get()
            .await
            .context("Failed to obtain a DB connection pool")?)
    }
}

async fn lock_order(conn: &mut AsyncPgConnection, id: Uuid) -> StoreResult<Order> {
    let row: OrderEntity = orders::table
        .find(id)
        .select(OrderEntity::as_select())
        .for_update()
        .get_result(conn)
        .await
        .optional()?
        .ok_or(StoreError::NotFound("order"))?;
    Ok(row.try_into()?)
}

async fn write_status(
    conn: &mut AsyncPgConnection,
    id: Uuid,
    write: &StatusWrite,
) -> StoreResult<OrderEntity> {
    Ok(diesel::update(orders::table.find(id))
        .set((
            orders::status.eq(write.status.as_str()),
            orders::completed_at.eq(write.completed_at),
            orders::cancelled_at.eq(write.cancelled_at),
            orders::cancellation_reason.eq(write.cancellation_reason.clone()),
            orders::revision.eq(orders::revision + 1),
            orders::updated_at.eq(diesel::dsl::now),
        ))
        .returning(OrderEntity::as_returning())
        .get_result(conn)
        .await?)
}

impl DeliveryStore for PgStore {
    fn create_order(&self, order: NewOrder) -> BoxFuture<'_, StoreResult<Order>> {
        Box::pin(async move {
            let conn = &mut self.conn().await?;
            let row = diesel::insert_into(orders::table)
                .values(CreateOrderEntity {
                    store_id: order.store_id,
                    status: OrderStatus::Entrada.as_str().into(),
                    delivery_type: order.delivery_type.as_str().into(),
                })
                .returning(OrderEntity::as_returning())
                .get_result(conn)
                .await
                .context("Failed to create order")?;
            Ok(row.try_into()?)
        })
    }

    fn get_order(&self, id: Uuid) -> BoxFuture<'_, StoreResult<Order>> {
        Box::pin(async move {
            let conn = &mut self.conn().await?;
            let row: OrderEntity = orders::table
                .find(id)
                .select(OrderEntity::as_select())
                .get_result(conn)
                .await
                .optional()?
                .ok_or(StoreError::NotFound("order"))?;
            Ok(row.try_into()?)
        })
    }

    fn query_orders(&self, filter: OrderFilter) -> BoxFuture<'_, StoreResult<Vec<Order>>> {
        Box::pin(async move {
            let conn = &mut self.conn().await?;
            let mut query = orders::table.select(OrderEntity::as_select()).into_boxed();
            if let Some(store_id) = filter.store_id {
                query = query.filter(orders::store_id.eq(store_id));
            }
            if let Some(status) = filter.status {
                query = query.filter(orders::status.eq(status.as_str()));
            }
            if let Some(delivery_type) = filter.delivery_type {
                query = query.filter(orders::delivery_type.eq(delivery_type.as_str()));
            }
            query = match filter.driver {
                DriverMatch::Any => query,
                DriverMatch::Unassigned => query.filter(orders::assigned_driver_id.is_null()),
                DriverMatch::Driver(id) => query.filter(orders::assigned_driver_id.eq(id)),
            };

            let rows: Vec<OrderEntity> = query
                .order_by(orders::created_at.asc())
                .load(conn)
                .await
                .context("Failed to query orders")?;
            Ok(rows
                .into_iter()
                .map(Order::try_from)
                .collect::<anyhow::Result<_>>()?)
        })
    }

    fn update_order_status(
        &self,
        id: Uuid,
        write: StatusWrite,
        expect: OrderPrecondition,
    ) -> BoxFuture<'_, StoreResult<Order>> {
        Box::pin(async move {
            let conn = &mut self.conn().await?;
            conn.transaction(move |conn| {
                Box::pin(async move {
                    let current = lock_order(conn, id).await?;
                    expect
                        .check(&current)
                        .map_err(StoreError::PreconditionFailed)?;
                    let row = write_status(conn, id, &write).await?;
                    Ok::<Order, StoreError>(row.try_into()?)
                })
            })
            .await
        })
    }

    fn claim_order(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
        fee_cents: i64,
    ) -> BoxFuture<'_, StoreResult<ClaimWrite>> {
        Box::pin(async move {
            let conn = &mut self.conn().await?;
            conn.transaction(move |conn| {
                Box::pin(async move {
                    // The precondition rides on the write itself.
                    let claimed: Option<OrderEntity> = diesel::update(orders::table.find(order_id))
                        .filter(orders::assigned_driver_id.is_null())
                        .filter(
                            orders::status
                                .eq(OrderStatus::EmPreparo.as_str())
                                .and(orders::delivery_type.eq(DeliveryType::Delivery.as_str())),
                        )
                        .set((
                            orders::assigned_driver_id.eq(driver_id),
                            orders::revision.eq(orders::revision + 1),
                            orders::updated_at.eq(diesel::dsl::now),
                        ))
                        .returning(OrderEntity::as_returning())
                        .get_result(conn)
                        .await
                        .optional()?;

                    let Some(claimed) = claimed else {
                        let current: OrderEntity = orders::table
                            .find(order_id)
                            .select(OrderEntity::as_select())
                            .get_result(conn)
                            .await
                            .optional()?
                            .ok_or(StoreError::NotFound("order"))?;
                        return Ok(ClaimWrite::Rejected {
                            current: current.try_into()?,
                        });
                    };

                    let assignment = diesel::insert_into(delivery_assignments::table)
                        .values(CreateAssignmentEntity {
                            order_id,
                            delivery_driver_id: driver_id,
                            store_id: claimed.store_id,
                            status: AssignmentStatus::Assigned.as_str().into(),
                            fee_cents,
                        })
                        .returning(AssignmentEntity::as_returning())
                        .get_result(conn)
                        .await
                        .context("Failed to create delivery assignment")?;

                    Ok::<ClaimWrite, StoreError>(ClaimWrite::Claimed {
                        order: claimed.try_into()?,
                        assignment: assignment.try_into()?,
                    })
                })
            })
            .await
        })
    }

    fn get_assignment(&self, id: Uuid) -> BoxFuture<'_, StoreResult<DeliveryAssignment>> {
        Box::pin(async move {
            let conn = &mut self.conn().await?;
            let row: AssignmentEntity = delivery_assignments::table
                .find(id)
                .select(AssignmentEntity::as_select())
                .get_result(conn)
                .await
                .optional()?
                .ok_or(StoreError::NotFound("assignment"))?;
            Ok(row.try_into()?)
        })
    }

    fn query_assignments(
        &self,
        filter: AssignmentFilter,
    ) -> BoxFuture<'_, StoreResult<Vec<DeliveryAssignment>>> {
        Box::pin(async move {
            let conn = &mut self.conn().await?;
            let mut query = delivery_assignments::table
                .select(AssignmentEntity::as_select())
                .into_boxed();
            if let Some(order_id) = filter.order_id {
                query = query.filter(delivery_assignments::order_id.eq(order_id));
            }
            if let Some(driver_id) = filter.driver_id {
                query = query.filter(delivery_assignments::delivery_driver_id.eq(driver_id));
            }
            if let Some(store_id) = filter.store_id {
                query = query.filter(delivery_assignments::store_id.eq(store_id));
            }
            if filter.active_only {
                query = query.filter(delivery_assignments::status.eq_any(ACTIVE_ASSIGNMENT_STATUSES));
            }

            let rows: Vec<AssignmentEntity> = query
                .order_by(delivery_assignments::assigned_at.asc())
                .load(conn)
                .await
                .context("Failed to query delivery assignments")?;
            Ok(rows
                .into_iter()
                .map(DeliveryAssignment::try_from)
                .collect::<anyhow::Result<_>>()?)
        })
    }

    fn commit_step(
        &self,
        step: DeliveryStep,
    ) -> BoxFuture<'_, StoreResult<(Order, DeliveryAssignment)>> {
        Box::pin(async move {
            let conn = &mut self.conn().await?;
            conn.transaction(move |conn| {
                Box::pin(async move {
                    let current = lock_order(conn, step.order_id).await?;
                    step.order_expect
                        .check(&current)
                        .map_err(StoreError::PreconditionFailed)?;

                    let assignment: AssignmentEntity = delivery_assignments::table
                        .find(step.assignment_id)
                        .select(AssignmentEntity::as_select())
                        .for_update()
                        .get_result(conn)
                        .await
                        .optional()?
                        .ok_or(StoreError::NotFound("assignment"))?;
                    if assignment.status != step.assignment_expect.as_str()
                        || assignment.order_id != step.order_id
                    {
                        return Err(StoreError::PreconditionFailed(format!(
                            "assignment {} is {}, expected {}",
                            assignment.id, assignment.status, step.assignment_expect
                        )));
                    }

                    let order = write_status(conn, step.order_id, &step.order).await?;
                    let assignment = diesel::update(delivery_assignments::table.find(step.assignment_id))
                        .set((
                            delivery_assignments::status.eq(step.assignment.status.as_str()),
                            delivery_assignments::picked_up_at.eq(step.assignment.picked_up_at),
                            delivery_assignments::delivered_at.eq(step.assignment.delivered_at),
                        ))
                        .returning(AssignmentEntity::as_returning())
                        .get_result(conn)
                        .await
                        .context("Failed to update delivery assignment")?;

                    if let Some(earning) = step.earning {
                        diesel::insert_into(driver_earnings::table)
                            .values(CreateEarningEntity {
                                assignment_id: earning.assignment_id,
                                order_id: earning.order_id,
                                delivery_driver_id: earning.delivery_driver_id,
                                store_id: earning.store_id,
                                amount_cents: earning.amount_cents,
                            })
                            .execute(conn)
                            .await
                            .context("Failed to record driver earning")?;
                    }

                    Ok::<(Order, DeliveryAssignment), StoreError>((
                        order.try_into()?,
                        assignment.try_into()?,
                    ))
                })
            })
            .await
        })
    }

    fn release_order(
        &self,
        order_id: Uuid,
        release: ReleaseWrite,
    ) -> BoxFuture<'_, StoreResult<(Order, Option<DeliveryAssignment>)>> {
        Box::pin(async move {
            let conn = &mut self.conn().await?;
            conn.transaction(move |conn| {
                Box::pin(async move {
                    let current = lock_order(conn, order_id).await?;
                    if !release.expected_driver.matches(current.assigned_driver_id) {
                        return Err(StoreError::PreconditionFailed(format!(
                            "order {} driver is {:?}, expected {:?}",
                            order_id, current.assigned_driver_id, release.expected_driver
                        )));
                    }
                    if let Some((_, expect)) = &release.status {
                        expect
                            .check(&current)
                            .map_err(StoreError::PreconditionFailed)?;
                    }

                    let cancelled: Option<AssignmentEntity> = diesel::update(
                        delivery_assignments::table
                            .filter(delivery_assignments::order_id.eq(order_id))
                            .filter(delivery_assignments::status.eq_any(ACTIVE_ASSIGNMENT_STATUSES)),
                    )
                    .set(delivery_assignments::status.eq(AssignmentStatus::Cancelled.as_str()))
                    .returning(AssignmentEntity::as_returning())
                    .get_result(conn)
                    .await
                    .optional()?;

                    if let Some((write, _)) = &release.status {
                        write_status(conn, order_id, write).await?;
                    }
                    let order: OrderEntity = diesel::update(orders::table.find(order_id))
                        .set((
                            orders::assigned_driver_id.eq(None::<Uuid>),
                            orders::revision.eq(orders::revision + 1),
                            orders::updated_at.eq(diesel::dsl::now),
                        ))
                        .returning(OrderEntity::as_returning())
                        .get_result(conn)
                        .await
                        .context("Failed to release order")?;

                    Ok::<(Order, Option<DeliveryAssignment>), StoreError>((
                        order.try_into()?,
                        cancelled.map(DeliveryAssignment::try_from).transpose()?,
                    ))
                })
            })
            .await
        })
    }

    fn query_earnings(&self, driver_id: Uuid) -> BoxFuture<'_, StoreResult<Vec<Earning>>> {
        Box::pin(async move {
            let conn = &mut self.conn().await?;
            let rows: Vec<EarningEntity> = driver_earnings::table
                .filter(driver_earnings::delivery_driver_id.eq(driver_id))
                .select(EarningEntity::as_select())
                .order_by(driver_earnings::created_at.asc())
                .load(conn)
                .await
                .context("Failed to query driver earnings")?;
            Ok(rows.into_iter().map(Earning::from).collect())
        })
    }
}
