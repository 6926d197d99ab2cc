//! Single-task event loop for one driver session.
//!
//! Bus changes, poll snapshots, presence changes and driver commands are all handled on
//! this one task, so the session's local view never sees concurrent mutation.

use std::{future, sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    coordinator::ClaimOutcome,
    domain::Order,
    error::{DeliveryError, Result},
    poller::{ReconciliationPoller, SyncHealth},
    presence::Presence,
    realtime::{ChannelHealth, OrderChange, RealtimeChannel, Subscription},
    session::{AssignmentView, DriverSession},
};

const COMMAND_BUFFER: usize = 16;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub poll_interval: Duration,
    pub poll_failure_threshold: u32,
    pub resubscribe_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            poll_failure_threshold: 3,
            resubscribe_delay: Duration::from_secs(30),
        }
    }
}

enum SessionCommand {
    Claim {
        order_id: Uuid,
        reply: oneshot::Sender<Result<ClaimOutcome>>,
    },
    MarkPickedUp {
        order_id: Uuid,
        reply: oneshot::Sender<Result<AssignmentView>>,
    },
    MarkDelivered {
        order_id: Uuid,
        reply: oneshot::Sender<Result<AssignmentView>>,
    },
    Open {
        order_id: Uuid,
    },
    Available {
        reply: oneshot::Sender<Vec<Order>>,
    },
    Assignments {
        reply: oneshot::Sender<Vec<AssignmentView>>,
    },
    Shutdown,
}

/// Handle to a running session. Dropping it does not stop the session; call `shutdown`.
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    health: watch::Receiver<ChannelHealth>,
    sync: watch::Receiver<SyncHealth>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(build(reply)).await.ok()?;
        rx.await.ok()
    }

    pub async fn claim(&self, order_id: Uuid) -> Result<ClaimOutcome> {
        self.request(|reply| SessionCommand::Claim { order_id, reply })
            .await
            .unwrap_or(Err(DeliveryError::ChannelDegraded))
    }

    pub async fn mark_picked_up(&self, order_id: Uuid) -> Result<AssignmentView> {
        self.request(|reply| SessionCommand::MarkPickedUp { order_id, reply })
            .await
            .unwrap_or(Err(DeliveryError::ChannelDegraded))
    }

    pub async fn mark_delivered(&self, order_id: Uuid) -> Result<AssignmentView> {
        self.request(|reply| SessionCommand::MarkDelivered { order_id, reply })
            .await
            .unwrap_or(Err(DeliveryError::ChannelDegraded))
    }

    pub async fn open(&self, order_id: Uuid) {
        let _ = self.commands.send(SessionCommand::Open { order_id }).await;
    }

    pub async fn available(&self) -> Vec<Order> {
        self.request(|reply| SessionCommand::Available { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn assignments(&self) -> Vec<AssignmentView> {
        self.request(|reply| SessionCommand::Assignments { reply })
            .await
            .unwrap_or_default()
    }

    pub fn channel_health(&self) -> watch::Receiver<ChannelHealth> {
        self.health.clone()
    }

    pub fn sync_health(&self) -> watch::Receiver<SyncHealth> {
        self.sync.clone()
    }

    /// Unsubscribes, stops polling and waits for the loop to exit.
    pub async fn shutdown(self) {
        let _ = self.commands.send(SessionCommand::Shutdown).await;
        if let Err(err) = self.task.await {
            warn!("Driver session task ended abnormally: {}", err);
        }
    }
}

struct Runtime {
    session: DriverSession,
    channel: Arc<dyn RealtimeChannel>,
    config: SessionConfig,
    health: watch::Sender<ChannelHealth>,
    subscription: Option<Subscription>,
    subscription_health: Option<watch::Receiver<ChannelHealth>>,
    resubscribe_at: Option<Instant>,
}

impl Runtime {
    async fn subscribe(&mut self) {
        let store_id = self.session.store_id();
        self.health.send_replace(ChannelHealth::Subscribing);
        match self.channel.subscribe(store_id).await {
            Ok(subscription) => {
                let health = subscription.health();
                self.health.send_replace(*health.borrow());
                if health.borrow().is_degraded() {
                    self.resubscribe_at = Some(Instant::now() + self.config.resubscribe_delay);
                }
                self.subscription_health = Some(health);
                self.subscription = Some(subscription);
            }
            Err(err) => {
                warn!("Failed to subscribe to store {}: {:#}", store_id, err);
                self.health.send_replace(ChannelHealth::Errored);
                self.resubscribe_at = Some(Instant::now() + self.config.resubscribe_delay);
            }
        }
    }

    fn drop_subscription(&mut self, health: ChannelHealth) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.subscription_health = None;
        self.health.send_replace(health);
        self.resubscribe_at = Some(Instant::now() + self.config.resubscribe_delay);
    }

    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::Claim { order_id, reply } => {
                let _ = reply.send(self.session.claim(order_id).await);
            }
            SessionCommand::MarkPickedUp { order_id, reply } => {
                let _ = reply.send(self.session.mark_picked_up(order_id).await);
            }
            SessionCommand::MarkDelivered { order_id, reply } => {
                let _ = reply.send(self.session.mark_delivered(order_id).await);
            }
            SessionCommand::Open { order_id } => self.session.open_order(order_id),
            SessionCommand::Available { reply } => {
                let _ = reply.send(self.session.available());
            }
            SessionCommand::Assignments { reply } => {
                let _ = reply.send(self.session.assignments());
            }
            SessionCommand::Shutdown => return false,
        }
        true
    }
}

async fn next_change(subscription: &mut Option<Subscription>) -> Option<OrderChange> {
    match subscription {
        Some(subscription) => subscription.next_change().await,
        None => future::pending().await,
    }
}

async fn health_changed(health: &mut Option<watch::Receiver<ChannelHealth>>) -> ChannelHealth {
    match health {
        Some(rx) => match rx.changed().await {
            Ok(()) => *rx.borrow_and_update(),
            Err(_) => future::pending().await,
        },
        None => future::pending().await,
    }
}

async fn resubscribe_due(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => future::pending().await,
    }
}

/// Starts the session loop: subscribes to the store's changes, arms the poller for
/// degraded periods, and follows the driver's presence.
pub fn spawn_session(
    session: DriverSession,
    channel: Arc<dyn RealtimeChannel>,
    mut presence: watch::Receiver<Presence>,
    config: SessionConfig,
) -> SessionHandle {
    let (commands_tx, mut commands) = mpsc::channel(COMMAND_BUFFER);
    let (health_tx, health_rx) = watch::channel(ChannelHealth::Subscribing);
    let (snapshots_tx, mut snapshots) = mpsc::channel(1);

    let poller = ReconciliationPoller::new(
        session.coordinator().clone(),
        session.store_id(),
        session.driver_id(),
        config.poll_interval,
        config.poll_failure_threshold,
        health_rx.clone(),
    );
    let sync = poller.sync_health();

    let task = tokio::spawn(async move {
        let poller = poller.spawn(snapshots_tx);
        let mut runtime = Runtime {
            session,
            channel,
            config,
            health: health_tx,
            subscription: None,
            subscription_health: None,
            resubscribe_at: None,
        };
        runtime.subscribe().await;
        info!(
            "Driver {} session started for store {}",
            runtime.session.driver_id(),
            runtime.session.store_id()
        );

        loop {
            tokio::select! {
                change = next_change(&mut runtime.subscription) => match change {
                    Some(change) => {
                        runtime.session.apply_change(change).await;
                    }
                    None => {
                        warn!("Change stream for store {} closed", runtime.session.store_id());
                        let health = runtime
                            .subscription
                            .as_ref()
                            .map(|s| s.current_health())
                            .filter(|h| h.is_degraded())
                            .unwrap_or(ChannelHealth::Closed);
                        runtime.drop_subscription(health);
                    }
                },
                health = health_changed(&mut runtime.subscription_health) => {
                    runtime.health.send_replace(health);
                    if health.is_degraded() && runtime.resubscribe_at.is_none() {
                        runtime.resubscribe_at =
                            Some(Instant::now() + runtime.config.resubscribe_delay);
                    }
                },
                _ = resubscribe_due(runtime.resubscribe_at) => {
                    runtime.resubscribe_at = None;
                    if let Some(subscription) = runtime.subscription.take() {
                        subscription.unsubscribe();
                    }
                    runtime.subscription_health = None;
                    runtime.subscribe().await;
                },
                Some(snapshot) = snapshots.recv() => {
                    if let Err(err) = runtime.session.reconcile(snapshot).await {
                        warn!("Failed to reconcile poll snapshot: {}", err);
                    }
                },
                Ok(()) = presence.changed() => {
                    let current = *presence.borrow_and_update();
                    runtime.session.on_presence_changed(&current);
                },
                command = commands.recv() => match command {
                    Some(command) => {
                        if !runtime.handle_command(command).await {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        poller.abort();
        if let Some(subscription) = runtime.subscription.take() {
            subscription.unsubscribe();
        }
        runtime.health.send_replace(ChannelHealth::Closed);
        info!("Driver {} session stopped", runtime.session.driver_id());
    });

    SessionHandle {
        commands: commands_tx,
        health: health_rx,
        sync,
        task,
    }
}
