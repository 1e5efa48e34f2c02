//! The synchronization engine: one task that owns the push channel, its
//! timers, the notification coalescer and the order store.
//!
//! Callers hold a [`SyncHandle`]. Every mutation of driver-visible state
//! happens inside [`run_sync_engine`], so the store and the seen-sets have a
//! single writer.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep, Sleep};
use tracing::{debug, info, warn};
use url::Url;

use crate::client::{AvailabilitySource, OrderApi, TokenProvider};
use crate::config::SyncConfig;
use crate::engine::coalescer::{NotificationCoalescer, Verdict};
use crate::engine::heartbeat::{ping_frame, Heartbeat};
use crate::engine::lifecycle::{LifecycleGate, Transition};
use crate::engine::normalizer::{normalize, Inbound, OrderEvent};
use crate::engine::polling::PollingFallback;
use crate::engine::reconnect::{ConnectionState, ReconnectPolicy, RetryDecision};
use crate::engine::store::{OrderStore, OrdersSnapshot};
use crate::engine::transport::{
    ChannelEvent, Connector, TransportSession, NORMAL_CLOSE,
};
use crate::error::{ActionError, ApiError, ConnectError};
use crate::models::order::{Order, OrderStatus};
use crate::observability::metrics::Metrics;

/// Notifications for UI consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    ConnectionChanged { connected: bool },
    NewOrder { order: Order },
    OrderUpdated { order: Order },
    OrderRemoved { order_id: String },
    /// An order now held by this driver, after accept or a status change.
    OrderAssigned { order: Order },
    /// Full state after a refresh landed.
    Resynced { orders: OrdersSnapshot },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Completed,
    /// The server no longer knows the order; the local removal stands.
    AlreadyResolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub connection: ConnectionState,
    pub polling: bool,
    pub active: bool,
    pub enabled: bool,
    pub foreground: bool,
    pub reconnect_attempts: u32,
}

/// External services the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn Connector>,
    pub tokens: Arc<dyn TokenProvider>,
    pub api: Arc<dyn OrderApi>,
    pub availability: Arc<dyn AvailabilitySource>,
    pub endpoint: Url,
}

enum Command {
    Start,
    Stop,
    Enable,
    Disable,
    Foreground,
    Background,
    Refresh,
    ResetSession,
    Withdraw(String),
    Assigned(Order),
    AssignedUpdated(Order),
    Forget(String),
    Status(oneshot::Sender<EngineStatus>),
}

type RefreshResult = Result<(Vec<Order>, Vec<Order>), ApiError>;

pub struct SyncEngine {
    config: SyncConfig,
    deps: Collaborators,
    metrics: Metrics,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<SyncEvent>,
    gate: LifecycleGate,
    policy: ReconnectPolicy,
    heartbeat: Heartbeat,
    poller: PollingFallback,
    coalescer: NotificationCoalescer,
    store: OrderStore,
    session: Option<TransportSession>,
    connecting: Option<BoxFuture<'static, Result<TransportSession, ConnectError>>>,
    retry: Option<Pin<Box<Sleep>>>,
    refreshing: Option<BoxFuture<'static, RefreshResult>>,
    /// Another refresh was asked for while one was in flight.
    refresh_again: bool,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        deps: Collaborators,
        metrics: Metrics,
        event_buffer_size: usize,
        command_buffer_size: usize,
    ) -> (Self, SyncHandle) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer_size.max(1));
        let (events_tx, _unused_rx) = broadcast::channel(event_buffer_size.max(1));
        let (store, snapshot) = OrderStore::new();

        let handle = SyncHandle {
            commands: command_tx,
            events: events_tx.clone(),
            snapshot,
            api: deps.api.clone(),
            request_timeout: config.request_timeout,
        };

        let engine = Self {
            policy: ReconnectPolicy::new(
                config.reconnect_base,
                config.reconnect_cap,
                config.reconnect_max_attempts,
            ),
            heartbeat: Heartbeat::new(config.heartbeat_interval),
            poller: PollingFallback::new(config.poll_interval),
            config,
            deps,
            metrics,
            commands: command_rx,
            events: events_tx,
            gate: LifecycleGate::default(),
            coalescer: NotificationCoalescer::new(),
            store,
            session: None,
            connecting: None,
            retry: None,
            refreshing: None,
            refresh_again: false,
        };

        (engine, handle)
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start => {
                let transition = self.gate.start();
                self.apply(transition);
            }
            Command::Stop => {
                let transition = self.gate.stop();
                self.apply(transition);
            }
            Command::Enable => {
                let transition = self.gate.enable();
                self.apply(transition);
            }
            Command::Disable => {
                let transition = self.gate.disable();
                self.apply(transition);
            }
            Command::Foreground => {
                let transition = self.gate.foreground();
                self.apply(transition);
            }
            Command::Background => {
                let transition = self.gate.background();
                self.apply(transition);
            }
            Command::Refresh => {
                if !self.gate.is_active() {
                    return;
                }
                // An explicit request must see data fetched after it was made.
                if self.refreshing.is_some() {
                    self.refresh_again = true;
                } else {
                    self.request_refresh();
                }
            }
            Command::ResetSession => {
                info!("resetting driver session state");
                // A fetch issued for the previous driver must not land.
                self.refreshing = None;
                self.refresh_again = false;
                self.coalescer.reset();
                self.store.reset();
                if self.gate.is_active() {
                    self.request_refresh();
                }
            }
            Command::Withdraw(id) => {
                if self.store.withdraw(&id) {
                    debug!(order_id = %id, "order withdrawn from available");
                    self.emit(SyncEvent::OrderRemoved { order_id: id });
                }
            }
            Command::Assigned(order) => {
                self.store.assign(order.clone());
                self.emit(SyncEvent::OrderAssigned { order });
            }
            Command::AssignedUpdated(order) => {
                let changed = self.store.update_assigned(order.clone());
                if !order.status.is_terminal() {
                    self.emit(SyncEvent::OrderAssigned { order });
                } else if changed {
                    self.emit(SyncEvent::OrderRemoved { order_id: order.id });
                }
            }
            Command::Forget(id) => {
                if self.store.forget(&id) {
                    self.emit(SyncEvent::OrderRemoved { order_id: id });
                }
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn apply(&mut self, transition: Transition) {
        match transition {
            Transition::Restart => {
                self.teardown();
                self.activate();
            }
            Transition::Shutdown => self.teardown(),
            Transition::Unchanged => {}
        }
    }

    fn activate(&mut self) {
        info!("sync engine activated");
        self.policy.reset();
        self.begin_connect();
        self.request_refresh();
    }

    /// Cancels every timer and in-flight operation and closes the channel
    /// deliberately. Nothing scheduled before this call can fire after it.
    fn teardown(&mut self) {
        self.connecting = None;
        self.retry = None;
        self.refreshing = None;
        self.refresh_again = false;
        self.store.abandon_refresh();
        self.heartbeat.stop();
        self.stop_polling();
        if let Some(session) = self.session.take() {
            session.close(NORMAL_CLOSE);
        }
        self.policy.reset();
        self.set_connected(false);
    }

    fn begin_connect(&mut self) {
        if !self.gate.is_active() {
            return;
        }

        if let Some(previous) = self.session.take() {
            previous.close(NORMAL_CLOSE);
        }
        self.heartbeat.stop();
        self.policy.on_connecting();

        debug!(attempt = self.policy.attempts(), "opening push channel");
        self.connecting = Some(Box::pin(TransportSession::open(
            self.deps.connector.clone(),
            self.deps.tokens.clone(),
            self.deps.endpoint.clone(),
            self.config.request_timeout,
        )));
    }

    fn on_connect_result(&mut self, result: Result<TransportSession, ConnectError>) {
        match result {
            Ok(session) => {
                if !self.gate.is_active() {
                    session.close(NORMAL_CLOSE);
                    return;
                }
                info!(session_id = %session.id(), "push channel connected");
                self.policy.on_open();
                self.session = Some(session);
                self.stop_polling();
                self.heartbeat.start();
                self.set_connected(true);
                self.request_refresh();
            }
            Err(err) => {
                warn!(error = %err, "push channel connect failed");
                self.on_failure();
            }
        }
    }

    fn on_failure(&mut self) {
        self.heartbeat.stop();
        self.session = None;
        self.set_connected(false);

        match self
            .policy
            .on_failure(self.gate.is_active(), self.gate.is_enabled())
        {
            RetryDecision::Idle => debug!("engine inactive; not reconnecting"),
            RetryDecision::Retry { attempt, delay } => {
                self.metrics.reconnect_attempts_total.inc();
                info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling push channel reconnect"
                );
                self.retry = Some(Box::pin(sleep(delay)));
            }
            RetryDecision::Fallback => {
                warn!(
                    attempts = self.policy.attempts(),
                    "reconnect attempts exhausted; falling back to polling"
                );
                self.start_polling();
            }
        }
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(text) => self.on_message(&text),
            ChannelEvent::Error(err) => warn!(error = %err, "push channel error"),
            ChannelEvent::Closed { code, reason } => {
                if code == NORMAL_CLOSE {
                    info!(code, reason = %reason, "push channel closed by server");
                    self.heartbeat.stop();
                    self.session = None;
                    self.policy.on_closed();
                    self.set_connected(false);
                    if self.gate.is_active() {
                        self.start_polling();
                    }
                } else {
                    warn!(code, reason = %reason, "push channel dropped");
                    self.on_failure();
                }
            }
        }
    }

    fn on_message(&mut self, text: &str) {
        match normalize(text) {
            Inbound::Event(event) => self.apply_event(event),
            Inbound::Control => debug!("channel control frame"),
            Inbound::Ignored => {}
            Inbound::Malformed => self.metrics.malformed_messages_total.inc(),
        }
    }

    fn apply_event(&mut self, event: OrderEvent) {
        self.metrics
            .events_total
            .with_label_values(&[event.kind()])
            .inc();

        let availability = self.deps.availability.availability();

        match event {
            OrderEvent::NewOrder(order) => {
                if self.store.contains(&order.id) {
                    // Still recorded so an in-flight refresh keeps it.
                    self.store
                        .apply_push_event(&OrderEvent::NewOrder(order.clone()));
                    debug!(order_id = %order.id, "new order event for a known order");
                    return;
                }
                let verdict = self.coalescer.decide(&order, availability);
                self.store
                    .apply_push_event(&OrderEvent::NewOrder(order.clone()));
                debug!(order_id = %order.id, ?verdict, "new order event");
                self.notify(order, verdict);
            }
            OrderEvent::OrderUpdated(order) => {
                let changed = self
                    .store
                    .apply_push_event(&OrderEvent::OrderUpdated(order.clone()));
                if changed && availability.accepts_new_work() {
                    self.emit(SyncEvent::OrderUpdated { order });
                }
            }
            OrderEvent::OrderRemoved(id) => {
                if self
                    .store
                    .apply_push_event(&OrderEvent::OrderRemoved(id.clone()))
                {
                    self.emit(SyncEvent::OrderRemoved { order_id: id });
                }
            }
        }
    }

    fn notify(&mut self, order: Order, verdict: Verdict) {
        let kind = match verdict {
            Verdict::NotifyBatch => "batch",
            Verdict::NotifyOrder => "order",
            _ => return,
        };

        self.metrics
            .notifications_total
            .with_label_values(&[kind])
            .inc();
        info!(
            order_id = %order.id,
            batch_id = order.batch_id.as_deref().unwrap_or(""),
            kind,
            "new work available"
        );
        self.emit(SyncEvent::NewOrder { order });
    }

    fn request_refresh(&mut self) {
        if self.refreshing.is_some() {
            debug!("refresh already in flight");
            return;
        }

        self.store.begin_refresh();

        let api = self.deps.api.clone();
        let timeout = self.config.request_timeout;
        self.refreshing = Some(Box::pin(async move {
            let fetch = async {
                tokio::try_join!(api.fetch_available_orders(), api.fetch_assigned_orders())
            };
            match tokio::time::timeout(timeout, fetch).await {
                Ok(result) => result,
                Err(_) => Err(ApiError::Timeout),
            }
        }));
    }

    fn on_refresh_result(&mut self, result: RefreshResult) {
        match result {
            Ok((available, assigned)) => {
                self.metrics
                    .refresh_total
                    .with_label_values(&["success"])
                    .inc();

                let availability = self.deps.availability.availability();
                let mut surfaced = Vec::new();
                for order in &available {
                    let verdict = self.coalescer.decide(order, availability);
                    if verdict.notifies() {
                        surfaced.push((order.clone(), verdict));
                    }
                }

                debug!(
                    available = available.len(),
                    assigned = assigned.len(),
                    "applying full refresh"
                );
                self.store.apply_full_refresh(available, assigned);
                let snapshot = self.store.snapshot();
                self.emit(SyncEvent::Resynced {
                    orders: OrdersSnapshot::clone(&snapshot),
                });

                // Orders withdrawn locally while the fetch was out stay quiet.
                for (order, verdict) in surfaced {
                    if snapshot.available_order(&order.id).is_some() {
                        self.notify(order, verdict);
                    }
                }
            }
            Err(err) => {
                self.metrics
                    .refresh_total
                    .with_label_values(&["error"])
                    .inc();
                self.store.abandon_refresh();
                warn!(error = %err, "full refresh failed");
            }
        }

        if std::mem::take(&mut self.refresh_again) {
            self.request_refresh();
        }
    }

    fn on_poll_tick(&mut self) {
        if !self.gate.is_active() {
            debug!("skipping poll tick while inactive");
            return;
        }
        if self.policy.is_connected() {
            self.stop_polling();
            return;
        }
        self.request_refresh();
    }

    fn start_polling(&mut self) {
        if self.policy.is_connected() || self.poller.is_active() {
            return;
        }
        self.poller.start();
        self.metrics.polling_active.set(1);
        self.request_refresh();
    }

    fn stop_polling(&mut self) {
        self.poller.stop();
        self.metrics.polling_active.set(0);
    }

    fn send_heartbeat(&mut self) {
        if let Some(session) = &self.session {
            if let Err(err) = session.send(ping_frame()) {
                debug!(error = %err, "heartbeat not sent");
            }
        }
    }

    fn set_connected(&mut self, connected: bool) {
        if self.store.is_connected() == connected {
            return;
        }
        self.store.set_connected(connected);
        self.metrics.connection_state.set(i64::from(connected));
        self.emit(SyncEvent::ConnectionChanged { connected });
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            connection: self.policy.state(),
            polling: self.poller.is_active(),
            active: self.gate.is_active(),
            enabled: self.gate.is_enabled(),
            foreground: self.gate.is_foreground(),
            reconnect_attempts: self.policy.attempts(),
        }
    }
}

async fn next_ready<F>(slot: &mut Option<F>) -> F::Output
where
    F: Future + Unpin,
{
    match slot.as_mut() {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_channel_event(session: &mut Option<TransportSession>) -> ChannelEvent {
    match session.as_mut() {
        Some(session) => session.next_event().await,
        None => std::future::pending().await,
    }
}

pub async fn run_sync_engine(mut engine: SyncEngine) {
    info!("sync engine started");

    loop {
        tokio::select! {
            biased;

            command = engine.commands.recv() => match command {
                Some(command) => engine.handle_command(command),
                None => break,
            },
            result = next_ready(&mut engine.connecting) => {
                engine.connecting = None;
                engine.on_connect_result(result);
            }
            event = next_channel_event(&mut engine.session) => engine.on_channel_event(event),
            _ = engine.heartbeat.tick() => engine.send_heartbeat(),
            _ = next_ready(&mut engine.retry) => {
                engine.retry = None;
                engine.begin_connect();
            }
            _ = engine.poller.tick() => engine.on_poll_tick(),
            result = next_ready(&mut engine.refreshing) => {
                engine.refreshing = None;
                engine.on_refresh_result(result);
            }
        }
    }

    engine.teardown();
    warn!("sync engine stopped: command channel closed");
}

/// Cloneable front door to a running engine.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SyncEvent>,
    snapshot: watch::Receiver<Arc<OrdersSnapshot>>,
    api: Arc<dyn OrderApi>,
    request_timeout: Duration,
}

impl SyncHandle {
    pub async fn start(&self) -> Result<(), ActionError> {
        self.send(Command::Start).await
    }

    pub async fn stop(&self) -> Result<(), ActionError> {
        self.send(Command::Stop).await
    }

    pub async fn enable(&self) -> Result<(), ActionError> {
        self.send(Command::Enable).await
    }

    pub async fn disable(&self) -> Result<(), ActionError> {
        self.send(Command::Disable).await
    }

    pub async fn enter_foreground(&self) -> Result<(), ActionError> {
        self.send(Command::Foreground).await
    }

    pub async fn enter_background(&self) -> Result<(), ActionError> {
        self.send(Command::Background).await
    }

    pub async fn refresh(&self) -> Result<(), ActionError> {
        self.send(Command::Refresh).await
    }

    /// Logout or driver switch: forget surfaced orders and batches.
    pub async fn reset_session(&self) -> Result<(), ActionError> {
        self.send(Command::ResetSession).await
    }

    pub async fn status(&self) -> Result<EngineStatus, ActionError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Status(reply)).await?;
        response.await.map_err(|_| ActionError::EngineStopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> Arc<OrdersSnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Arc<OrdersSnapshot>> {
        self.snapshot.clone()
    }

    pub async fn accept_order(&self, id: &str) -> Result<ActionOutcome, ActionError> {
        self.send(Command::Withdraw(id.to_string())).await?;
        match self.call(self.api.accept_order(id)).await {
            Ok(order) => {
                info!(order_id = %id, "order accepted");
                self.send(Command::Assigned(order)).await?;
                Ok(ActionOutcome::Completed)
            }
            Err(err) => self.resolve_failure(id, "accept", err).await,
        }
    }

    pub async fn decline_order(&self, id: &str) -> Result<ActionOutcome, ActionError> {
        self.send(Command::Withdraw(id.to_string())).await?;
        match self.call(self.api.decline_order(id)).await {
            Ok(()) => {
                info!(order_id = %id, "order declined");
                Ok(ActionOutcome::Completed)
            }
            Err(err) => self.resolve_failure(id, "decline", err).await,
        }
    }

    pub async fn update_order_status(
        &self,
        id: &str,
        status: OrderStatus,
    ) -> Result<ActionOutcome, ActionError> {
        match self.call(self.api.update_order_status(id, status)).await {
            Ok(order) => {
                info!(order_id = %id, ?status, "order status updated");
                self.send(Command::AssignedUpdated(order)).await?;
                Ok(ActionOutcome::Completed)
            }
            Err(ApiError::NotFound) => {
                self.send(Command::Forget(id.to_string())).await?;
                self.resolve_failure(id, "update_status", ApiError::NotFound)
                    .await
            }
            Err(err) => self.resolve_failure(id, "update_status", err).await,
        }
    }

    async fn call<T>(
        &self,
        request: impl Future<Output = Result<T, ApiError>>,
    ) -> Result<T, ApiError> {
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout),
        }
    }

    async fn resolve_failure(
        &self,
        id: &str,
        action: &'static str,
        err: ApiError,
    ) -> Result<ActionOutcome, ActionError> {
        match err {
            ApiError::NotFound => {
                info!(order_id = %id, action, "order already resolved on server");
                Ok(ActionOutcome::AlreadyResolved)
            }
            ApiError::Timeout => {
                warn!(order_id = %id, action, "order action timed out");
                self.send(Command::Refresh).await?;
                Err(ActionError::Timeout)
            }
            other => {
                warn!(order_id = %id, action, error = %other, "order action rejected");
                self.send(Command::Refresh).await?;
                Err(ActionError::Rejected(other))
            }
        }
    }

    async fn send(&self, command: Command) -> Result<(), ActionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ActionError::EngineStopped)
    }
}
