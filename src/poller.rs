//! Fallback fetch that stands in for the bus while it is unhealthy.

use std::time::Duration;

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    coordinator::AssignmentCoordinator, error::Result, realtime::ChannelHealth,
    session::PollSnapshot,
};

/// How the session is currently keeping up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncHealth {
    Live,
    Polling,
    /// Polling has failed repeatedly; the only state worth showing the driver.
    Failing,
}

pub struct ReconciliationPoller {
    coordinator: AssignmentCoordinator,
    store_id: Uuid,
    driver_id: Uuid,
    interval: Duration,
    failure_threshold: u32,
    health: watch::Receiver<ChannelHealth>,
    sync: watch::Sender<SyncHealth>,
    consecutive_failures: u32,
}

impl ReconciliationPoller {
    pub fn new(
        coordinator: AssignmentCoordinator,
        store_id: Uuid,
        driver_id: Uuid,
        interval: Duration,
        failure_threshold: u32,
        health: watch::Receiver<ChannelHealth>,
    ) -> Self {
        Self {
            coordinator,
            store_id,
            driver_id,
            interval,
            failure_threshold: failure_threshold.max(1),
            health,
            sync: watch::channel(SyncHealth::Live).0,
            consecutive_failures: 0,
        }
    }

    pub fn sync_health(&self) -> watch::Receiver<SyncHealth> {
        self.sync.subscribe()
    }

    pub fn is_armed(&self) -> bool {
        self.health.borrow().is_degraded()
    }

    /// Runs the same queries a connected client relies on.
    pub async fn fetch(&self) -> Result<PollSnapshot> {
        let available = self.coordinator.list_available(self.store_id).await?;
        let assigned = self
            .coordinator
            .active_assignments(self.driver_id)
            .await?
            .into_iter()
            .filter(|(_, order)| order.store_id == self.store_id)
            .collect();
        Ok(PollSnapshot {
            available,
            assigned,
        })
    }

    /// One interval's worth of work. Does nothing while the bus is healthy.
    pub async fn tick(&mut self) -> Option<PollSnapshot> {
        if !self.is_armed() {
            if self.consecutive_failures > 0 || *self.sync.borrow() != SyncHealth::Live {
                info!("Bus healthy again for store {}, polling paused", self.store_id);
            }
            self.consecutive_failures = 0;
            self.sync.send_replace(SyncHealth::Live);
            return None;
        }

        match self.fetch().await {
            Ok(snapshot) => {
                debug!(
                    "Polled store {}: {} available, {} assigned",
                    self.store_id,
                    snapshot.available.len(),
                    snapshot.assigned.len()
                );
                self.consecutive_failures = 0;
                self.sync.send_replace(SyncHealth::Polling);
                Some(snapshot)
            }
            Err(err) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    error!(
                        "Polling store {} failed {} times in a row: {}",
                        self.store_id, self.consecutive_failures, err
                    );
                    self.sync.send_replace(SyncHealth::Failing);
                } else {
                    warn!("Polling store {} failed: {}", self.store_id, err);
                    self.sync.send_replace(SyncHealth::Polling);
                }
                None
            }
        }
    }

    /// Polls on a fixed interval, handing snapshots to the session loop.
    pub fn spawn(mut self, sink: mpsc::Sender<PollSnapshot>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Some(snapshot) = self.tick().await {
                    if sink.send(snapshot).await.is_err() {
                        break;
                    }
                }
            }
        })
    }
}
