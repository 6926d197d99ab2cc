//! Claim and delivery flow against the in-memory store.

mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use common::{FEE_CENTS, Harness};
use delivery_orderservice::{
    coordinator::ClaimOutcome,
    domain::{AssignmentStatus, DeliveryAssignment, DeliveryType, OrderStatus},
    error::DeliveryError,
    realtime::RealtimeChannel,
    state_machine::{Actor, TransitionError},
    stores::{AssignmentFilter, DeliveryStore},
};
use uuid::Uuid;

async fn assignments_for(h: &Harness, order_id: Uuid) -> Vec<DeliveryAssignment> {
    h.store
        .query_assignments(AssignmentFilter {
            order_id: Some(order_id),
            ..Default::default()
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn delivery_order_runs_from_entrada_to_concluido() {
    let h = Harness::new();
    let store_id = Uuid::new_v4();
    let (driver_a, driver_b) = (Uuid::new_v4(), Uuid::new_v4());

    let order = h.order(store_id, DeliveryType::Delivery).await;
    assert_eq!(order.status, OrderStatus::Entrada);
    assert!(h.coordinator.list_available(store_id).await.unwrap().is_empty());

    let order = h.advance(&order, OrderStatus::EmPreparo).await;
    let available = h.coordinator.list_available(store_id).await.unwrap();
    assert_eq!(available.iter().map(|o| o.id).collect::<Vec<_>>(), vec![order.id]);

    let (a, b) = tokio::join!(
        h.coordinator.claim(order.id, driver_a),
        h.coordinator.claim(order.id, driver_b)
    );
    let (winner, assignment) = match (a.unwrap(), b.unwrap()) {
        (ClaimOutcome::Claimed { assignment, .. }, ClaimOutcome::AlreadyClaimed { order }) => {
            assert_eq!(order.assigned_driver_id, Some(driver_a));
            (driver_a, assignment)
        }
        (ClaimOutcome::AlreadyClaimed { order }, ClaimOutcome::Claimed { assignment, .. }) => {
            assert_eq!(order.assigned_driver_id, Some(driver_b));
            (driver_b, assignment)
        }
        other => panic!("expected exactly one winner, got {:?}", other),
    };
    assert_eq!(assignment.status, AssignmentStatus::Assigned);
    assert_eq!(assignment.fee_cents, FEE_CENTS);
    assert!(h.coordinator.list_available(store_id).await.unwrap().is_empty());

    let order = h.lifecycle.get_order(order.id).await.unwrap();
    h.advance(&order, OrderStatus::AguardaRetirada).await;

    let (order, picked) = h
        .coordinator
        .mark_picked_up(assignment.id, winner)
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::EmTransito);
    assert_eq!(picked.status, AssignmentStatus::PickedUp);
    assert!(picked.picked_up_at.is_some());

    let (order, delivered) = h
        .coordinator
        .mark_delivered(assignment.id, winner)
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Concluido);
    assert!(order.completed_at.is_some());
    assert_eq!(delivered.status, AssignmentStatus::Delivered);

    let earnings = h.coordinator.earnings(winner).await.unwrap();
    assert_eq!(earnings.len(), 1);
    assert_eq!(earnings[0].amount_cents, FEE_CENTS);
    assert_eq!(earnings[0].order_id, order.id);
}

#[tokio::test]
async fn many_concurrent_claims_leave_one_assignment() {
    let h = Arc::new(Harness::new());
    let store_id = Uuid::new_v4();
    let order = h.preparing(store_id).await;

    let claimed = Arc::new(AtomicU32::new(0));
    let lost = Arc::new(AtomicU32::new(0));
    let drivers = 8_u32;

    let handles: Vec<_> = (0..drivers)
        .map(|_| {
            let h = h.clone();
            let claimed = claimed.clone();
            let lost = lost.clone();
            tokio::spawn(async move {
                match h.coordinator.claim(order.id, Uuid::new_v4()).await.unwrap() {
                    ClaimOutcome::Claimed { .. } => claimed.fetch_add(1, Ordering::SeqCst),
                    ClaimOutcome::AlreadyClaimed { .. } => lost.fetch_add(1, Ordering::SeqCst),
                };
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(claimed.load(Ordering::SeqCst), 1, "exactly one claim wins");
    assert_eq!(lost.load(Ordering::SeqCst), drivers - 1);

    let assignments = assignments_for(&h, order.id).await;
    assert_eq!(assignments.len(), 1);
    let order = h.lifecycle.get_order(order.id).await.unwrap();
    assert_eq!(order.assigned_driver_id, Some(assignments[0].delivery_driver_id));
}

#[tokio::test]
async fn repeated_claim_by_the_winner_returns_its_assignment() {
    let h = Harness::new();
    let driver = Uuid::new_v4();
    let order = h.preparing(Uuid::new_v4()).await;

    let first = h.coordinator.claim(order.id, driver).await.unwrap();
    let second = h.coordinator.claim(order.id, driver).await.unwrap();
    match (first, second) {
        (
            ClaimOutcome::Claimed { assignment: a, .. },
            ClaimOutcome::Claimed { assignment: b, .. },
        ) => assert_eq!(a.id, b.id),
        other => panic!("unexpected outcomes {:?}", other),
    }
    assert_eq!(assignments_for(&h, order.id).await.len(), 1);
}

#[tokio::test]
async fn pickup_order_is_never_available() {
    let h = Harness::new();
    let store_id = Uuid::new_v4();
    let order = h.order(store_id, DeliveryType::Pickup).await;

    for status in [OrderStatus::EmPreparo, OrderStatus::AguardaRetirada, OrderStatus::Concluido] {
        let current = h.lifecycle.get_order(order.id).await.unwrap();
        h.advance(&current, status).await;
        assert!(h.coordinator.list_available(store_id).await.unwrap().is_empty());
    }

    let table = h.order(store_id, DeliveryType::Table).await;
    h.advance(&table, OrderStatus::EmPreparo).await;
    assert!(h.coordinator.list_available(store_id).await.unwrap().is_empty());

    let err = h.coordinator.claim(table.id, Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(
        err,
        DeliveryError::InvalidTransition(TransitionError::NotClaimable { .. })
    ));
}

#[tokio::test]
async fn pick_up_outside_aguarda_retirada_changes_nothing() {
    let h = Harness::new();
    let driver = Uuid::new_v4();
    let order = h.preparing(Uuid::new_v4()).await;
    let ClaimOutcome::Claimed { assignment, .. } = h.coordinator.claim(order.id, driver).await.unwrap()
    else {
        panic!("claim should win");
    };
    let before = h.lifecycle.get_order(order.id).await.unwrap();

    let err = h
        .coordinator
        .mark_picked_up(assignment.id, driver)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DeliveryError::InvalidTransition(TransitionError::InvalidTransition {
            from: OrderStatus::EmPreparo,
            to: OrderStatus::EmTransito,
            ..
        })
    ));

    assert_eq!(h.lifecycle.get_order(order.id).await.unwrap(), before);
    assert_eq!(
        h.store.get_assignment(assignment.id).await.unwrap(),
        assignment
    );
}

#[tokio::test]
async fn only_the_assigned_driver_can_progress_an_assignment() {
    let h = Harness::new();
    let (driver, intruder) = (Uuid::new_v4(), Uuid::new_v4());
    let order = h.preparing(Uuid::new_v4()).await;
    let ClaimOutcome::Claimed { assignment, .. } = h.coordinator.claim(order.id, driver).await.unwrap()
    else {
        panic!("claim should win");
    };
    let order = h.lifecycle.get_order(order.id).await.unwrap();
    h.advance(&order, OrderStatus::AguardaRetirada).await;

    let err = h
        .coordinator
        .mark_picked_up(assignment.id, intruder)
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::NotFound("assignment")));
}

#[tokio::test]
async fn delivered_straight_from_aguarda_retirada_passes_through_em_transito() {
    let h = Harness::new();
    let store_id = Uuid::new_v4();
    let driver = Uuid::new_v4();
    let order = h.preparing(store_id).await;
    let ClaimOutcome::Claimed { assignment, .. } = h.coordinator.claim(order.id, driver).await.unwrap()
    else {
        panic!("claim should win");
    };
    let order = h.lifecycle.get_order(order.id).await.unwrap();
    h.advance(&order, OrderStatus::AguardaRetirada).await;

    let mut subscription = h.bus.subscribe(store_id).await.unwrap();
    let (order, delivered) = h
        .coordinator
        .mark_delivered(assignment.id, driver)
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Concluido);
    assert_eq!(delivered.status, AssignmentStatus::Delivered);
    assert!(delivered.picked_up_at.is_some());

    let mut published = Vec::new();
    while let Ok(Some(change)) =
        tokio::time::timeout(Duration::from_millis(50), subscription.next_change()).await
    {
        published.push((change.order.status, change.order.revision));
    }
    assert_eq!(
        published.iter().map(|(status, _)| *status).collect::<Vec<_>>(),
        vec![OrderStatus::EmTransito, OrderStatus::Concluido]
    );
    assert!(published[0].1 < published[1].1);
    assert_eq!(h.coordinator.earnings(driver).await.unwrap().len(), 1);
}

#[tokio::test]
async fn operator_cannot_complete_an_order_a_driver_holds() {
    let h = Harness::new();
    let driver = Uuid::new_v4();
    let order = h.preparing(Uuid::new_v4()).await;
    let ClaimOutcome::Claimed { assignment, .. } = h.coordinator.claim(order.id, driver).await.unwrap()
    else {
        panic!("claim should win");
    };
    let order = h.lifecycle.get_order(order.id).await.unwrap();
    h.advance(&order, OrderStatus::AguardaRetirada).await;
    h.coordinator.mark_picked_up(assignment.id, driver).await.unwrap();

    let err = h
        .lifecycle
        .advance(order.id, OrderStatus::Concluido, None, Actor::Operator)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DeliveryError::InvalidTransition(TransitionError::DriverAttached(OrderStatus::Concluido))
    ));

    let active = h.coordinator.active_assignments(driver).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].0.status, AssignmentStatus::PickedUp);
    assert_eq!(active[0].1.status, OrderStatus::EmTransito);

    // The driver can still close it, and gets paid for it.
    let (order, delivered) = h
        .coordinator
        .mark_delivered(assignment.id, driver)
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Concluido);
    assert_eq!(delivered.status, AssignmentStatus::Delivered);
    assert_eq!(h.coordinator.earnings(driver).await.unwrap().len(), 1);
    assert!(h.coordinator.active_assignments(driver).await.unwrap().is_empty());
}

#[tokio::test]
async fn operator_still_completes_unclaimed_pickup_orders() {
    let h = Harness::new();
    let order = h.order(Uuid::new_v4(), DeliveryType::Pickup).await;
    let order = h.advance(&order, OrderStatus::EmPreparo).await;
    let order = h.advance(&order, OrderStatus::AguardaRetirada).await;
    let order = h.advance(&order, OrderStatus::Concluido).await;
    assert!(order.completed_at.is_some());
}

#[tokio::test]
async fn accept_acknowledges_without_touching_the_order() {
    let h = Harness::new();
    let driver = Uuid::new_v4();
    let order = h.preparing(Uuid::new_v4()).await;
    let ClaimOutcome::Claimed { order, assignment } =
        h.coordinator.claim(order.id, driver).await.unwrap()
    else {
        panic!("claim should win");
    };

    let accepted = h.coordinator.accept(assignment.id, driver).await.unwrap();
    assert_eq!(accepted.status, AssignmentStatus::Accepted);
    assert_eq!(
        h.lifecycle.get_order(order.id).await.unwrap().status,
        OrderStatus::EmPreparo
    );

    let err = h.coordinator.accept(assignment.id, driver).await.unwrap_err();
    assert!(matches!(
        err,
        DeliveryError::InvalidTransition(TransitionError::AssignmentClosed(
            AssignmentStatus::Accepted
        ))
    ));
}

#[tokio::test]
async fn cancel_releases_the_driver_in_the_same_write() {
    let h = Harness::new();
    let driver = Uuid::new_v4();
    let order = h.preparing(Uuid::new_v4()).await;
    let ClaimOutcome::Claimed { assignment, .. } = h.coordinator.claim(order.id, driver).await.unwrap()
    else {
        panic!("claim should win");
    };

    let cancelled = h.lifecycle.cancel(order.id, "customer gave up").await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelado);
    assert_eq!(cancelled.assigned_driver_id, None);
    assert_eq!(cancelled.cancellation_reason.as_deref(), Some("customer gave up"));
    assert!(cancelled.cancelled_at.is_some());
    assert_eq!(
        h.store.get_assignment(assignment.id).await.unwrap().status,
        AssignmentStatus::Cancelled
    );

    let err = h.lifecycle.cancel(order.id, "again").await.unwrap_err();
    assert!(matches!(
        err,
        DeliveryError::InvalidTransition(TransitionError::AlreadyTerminal(OrderStatus::Cancelado))
    ));
}

#[tokio::test]
async fn unassign_returns_a_preparing_order_to_the_pool() {
    let h = Harness::new();
    let store_id = Uuid::new_v4();
    let order = h.preparing(store_id).await;
    h.coordinator.claim(order.id, Uuid::new_v4()).await.unwrap();

    let (released, cancelled) = h.coordinator.unassign(order.id).await.unwrap();
    assert_eq!(released.assigned_driver_id, None);
    assert_eq!(cancelled.map(|a| a.status), Some(AssignmentStatus::Cancelled));

    let available = h.coordinator.list_available(store_id).await.unwrap();
    assert_eq!(available.len(), 1);

    let next = Uuid::new_v4();
    assert!(matches!(
        h.coordinator.claim(order.id, next).await.unwrap(),
        ClaimOutcome::Claimed { .. }
    ));
    let active: Vec<_> = assignments_for(&h, order.id)
        .await
        .into_iter()
        .filter(|a| a.status.is_active())
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].delivery_driver_id, next);
}

#[tokio::test]
async fn stale_expected_status_is_a_precondition_failure() {
    let h = Harness::new();
    let order = h.preparing(Uuid::new_v4()).await;
    h.advance(&order, OrderStatus::AguardaRetirada).await;

    let err = h
        .lifecycle
        .advance(
            order.id,
            OrderStatus::AguardaRetirada,
            Some(OrderStatus::EmPreparo),
            Actor::Operator,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::PreconditionFailed(_)));
}

#[tokio::test]
async fn skipping_a_status_is_rejected() {
    let h = Harness::new();
    let order = h.order(Uuid::new_v4(), DeliveryType::Delivery).await;

    let err = h
        .lifecycle
        .advance(order.id, OrderStatus::AguardaRetirada, None, Actor::Operator)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DeliveryError::InvalidTransition(TransitionError::InvalidTransition { .. })
    ));
    assert_eq!(
        h.lifecycle.get_order(order.id).await.unwrap().status,
        OrderStatus::Entrada
    );
}
