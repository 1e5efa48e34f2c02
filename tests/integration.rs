use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tower::ServiceExt;
use url::Url;

use order_sync::api::rest::router;
use order_sync::client::availability::SharedAvailability;
use order_sync::client::token::StaticTokenProvider;
use order_sync::client::{AvailabilitySource, OrderApi};
use order_sync::config::SyncConfig;
use order_sync::engine::reconnect::ConnectionState;
use order_sync::engine::sync::{
    run_sync_engine, ActionOutcome, Collaborators, SyncEngine, SyncEvent, SyncHandle,
};
use order_sync::engine::transport::{Channel, ChannelEvent, Connector, Outbound};
use order_sync::error::{ActionError, ApiError, ConnectError};
use order_sync::models::driver::DriverAvailability;
use order_sync::models::order::{Order, OrderStatus};
use order_sync::observability::metrics::Metrics;
use order_sync::state::AppState;

struct ServerSide {
    to_client: mpsc::UnboundedSender<ChannelEvent>,
    from_client: mpsc::UnboundedReceiver<Outbound>,
}

impl ServerSide {
    fn push(&self, frame: Value) {
        self.to_client
            .send(ChannelEvent::Message(frame.to_string()))
            .unwrap();
    }

    fn close(&self, code: u16) {
        self.to_client
            .send(ChannelEvent::Closed {
                code,
                reason: String::new(),
            })
            .unwrap();
    }

    fn received(&mut self) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

#[derive(Default)]
struct ConnectorState {
    script: VecDeque<bool>,
    accept_by_default: bool,
    attempts: Vec<(Instant, Url)>,
    servers: VecDeque<ServerSide>,
}

#[derive(Default)]
struct MockConnector {
    state: Mutex<ConnectorState>,
}

impl MockConnector {
    fn accepting() -> Self {
        let connector = Self::default();
        connector.state.lock().unwrap().accept_by_default = true;
        connector
    }

    fn refusing() -> Self {
        Self::default()
    }

    fn script(&self, outcomes: &[bool]) {
        self.state.lock().unwrap().script.extend(outcomes.iter().copied());
    }

    fn attempts(&self) -> Vec<Instant> {
        self.state
            .lock()
            .unwrap()
            .attempts
            .iter()
            .map(|(at, _)| *at)
            .collect()
    }

    fn last_url(&self) -> Option<Url> {
        self.state
            .lock()
            .unwrap()
            .attempts
            .last()
            .map(|(_, url)| url.clone())
    }

    fn take_server(&self) -> ServerSide {
        self.state
            .lock()
            .unwrap()
            .servers
            .pop_front()
            .expect("no open channel")
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: Url) -> Result<Channel, ConnectError> {
        let mut state = self.state.lock().unwrap();
        state.attempts.push((Instant::now(), url));
        let accept = state
            .script
            .pop_front()
            .unwrap_or(state.accept_by_default);
        if !accept {
            return Err(ConnectError::Handshake("refused".to_string()));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        state.servers.push_back(ServerSide {
            to_client: in_tx,
            from_client: out_rx,
        });

        Ok(Channel {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[derive(Default)]
struct MockApi {
    available: Mutex<Vec<Order>>,
    assigned: Mutex<Vec<Order>>,
    action_error: Mutex<Option<ApiError>>,
    fetch_delay: Mutex<Duration>,
    fetches: AtomicUsize,
}

impl MockApi {
    fn set_available(&self, orders: Vec<Order>) {
        *self.available.lock().unwrap() = orders;
    }

    fn set_assigned(&self, orders: Vec<Order>) {
        *self.assigned.lock().unwrap() = orders;
    }

    /// Lists are read when the fetch starts and returned after the delay.
    fn delay_fetches(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = delay;
    }

    fn clear_action_error(&self) {
        *self.action_error.lock().unwrap() = None;
    }

    fn fail_actions_with(&self, err: ApiError) {
        *self.action_error.lock().unwrap() = Some(err);
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn action_result(&self) -> Result<(), ApiError> {
        match self.action_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl OrderApi for MockApi {
    async fn fetch_available_orders(&self) -> Result<Vec<Order>, ApiError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let orders = self.available.lock().unwrap().clone();
        let delay = *self.fetch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(orders)
    }

    async fn fetch_assigned_orders(&self) -> Result<Vec<Order>, ApiError> {
        let orders = self.assigned.lock().unwrap().clone();
        let delay = *self.fetch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(orders)
    }

    async fn accept_order(&self, id: &str) -> Result<Order, ApiError> {
        self.action_result()?;
        Ok(Order::new(id, OrderStatus::Assigned))
    }

    async fn decline_order(&self, _id: &str) -> Result<(), ApiError> {
        self.action_result()
    }

    async fn update_order_status(&self, id: &str, status: OrderStatus) -> Result<Order, ApiError> {
        self.action_result()?;
        Ok(Order::new(id, status))
    }
}

struct Harness {
    sync: SyncHandle,
    connector: Arc<MockConnector>,
    api: Arc<MockApi>,
    availability: Arc<SharedAvailability>,
    tokens: Arc<StaticTokenProvider>,
    events: broadcast::Receiver<SyncEvent>,
    metrics: Metrics,
}

fn harness(connector: MockConnector, config: SyncConfig) -> Harness {
    let connector = Arc::new(connector);
    let api = Arc::new(MockApi::default());
    let availability = Arc::new(SharedAvailability::new(DriverAvailability::on_duty()));
    let tokens = Arc::new(StaticTokenProvider::new(Some("secret".to_string())));
    let metrics = Metrics::new();

    let (engine, sync) = SyncEngine::new(
        config,
        Collaborators {
            connector: connector.clone(),
            tokens: tokens.clone(),
            api: api.clone(),
            availability: availability.clone(),
            endpoint: Url::parse("ws://dispatch.test/ws/driver/").unwrap(),
        },
        metrics.clone(),
        64,
        64,
    );
    let events = sync.subscribe();
    tokio::spawn(run_sync_engine(engine));

    Harness {
        sync,
        connector,
        api,
        availability,
        tokens,
        events,
        metrics,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn drain(events: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn notified_ids(events: &[SyncEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            SyncEvent::NewOrder { order } => Some(order.id.clone()),
            _ => None,
        })
        .collect()
}

fn new_order_frame(id: &str, batch: Option<&str>) -> Value {
    let mut order = json!({ "id": id, "status": "pending", "total": 21.5 });
    if let Some(batch) = batch {
        order["batch_id"] = json!(batch);
    }
    json!({ "type": "new_order", "order": order })
}

fn assert_gap(later: Instant, earlier: Instant, expected_ms: u64) {
    let gap = later.duration_since(earlier).as_millis() as i64;
    assert!(
        (gap - expected_ms as i64).abs() <= 5,
        "expected ~{expected_ms}ms, got {gap}ms"
    );
}

#[tokio::test(start_paused = true)]
async fn batch_notifies_once_for_first_order() {
    let mut h = harness(MockConnector::accepting(), SyncConfig::default());
    h.sync.start().await.unwrap();
    settle().await;

    let server = h.connector.take_server();
    drain(&mut h.events);

    server.push(new_order_frame("A1", Some("B1")));
    server.push(new_order_frame("A2", Some("B1")));
    settle().await;

    assert_eq!(notified_ids(&drain(&mut h.events)), vec!["A1".to_string()]);

    let snapshot = h.sync.snapshot();
    assert!(snapshot.available_order("A1").is_some());
    assert!(snapshot.available_order("A2").is_some());
}

#[tokio::test(start_paused = true)]
async fn refresh_never_renotifies_a_seen_batch() {
    let mut h = harness(MockConnector::accepting(), SyncConfig::default());
    h.sync.start().await.unwrap();
    settle().await;
    let server = h.connector.take_server();

    server.push(new_order_frame("A1", Some("B1")));
    settle().await;
    drain(&mut h.events);

    h.api.set_available(vec![
        Order::new("A1", OrderStatus::Pending).with_batch("B1"),
        Order::new("A3", OrderStatus::Pending).with_batch("B1"),
        Order::new("S1", OrderStatus::Pending),
    ]);
    h.sync.refresh().await.unwrap();
    settle().await;

    assert_eq!(notified_ids(&drain(&mut h.events)), vec!["S1".to_string()]);

    // A second refresh with the same ids surfaces nothing.
    h.sync.refresh().await.unwrap();
    settle().await;
    assert!(notified_ids(&drain(&mut h.events)).is_empty());
    assert_eq!(h.sync.snapshot().available.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn abnormal_close_backs_off_exponentially() {
    let connector = MockConnector::refusing();
    connector.script(&[true]);
    let h = harness(connector, SyncConfig::default());
    h.sync.start().await.unwrap();
    settle().await;

    let server = h.connector.take_server();
    let closed_at = Instant::now();
    server.close(1006);

    tokio::time::sleep(Duration::from_secs(10)).await;

    let attempts = h.connector.attempts();
    assert_eq!(attempts.len(), 4);
    assert_gap(attempts[1], closed_at, 1_000);
    assert_gap(attempts[2], attempts[1], 2_000);
    assert_gap(attempts[3], attempts[2], 4_000);
    assert_eq!(h.metrics.reconnect_attempts_total.get(), 4);
}

#[tokio::test(start_paused = true)]
async fn normal_close_schedules_no_retry() {
    let h = harness(MockConnector::accepting(), SyncConfig::default());
    h.sync.start().await.unwrap();
    settle().await;

    h.connector.take_server().close(1000);
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(h.connector.attempts().len(), 1);
    let status = h.sync.status().await.unwrap();
    assert_eq!(status.connection, ConnectionState::Disconnected);
    assert!(!h.sync.snapshot().connected);
}

#[tokio::test(start_paused = true)]
async fn offline_driver_is_not_notified_but_state_merges() {
    let mut h = harness(MockConnector::accepting(), SyncConfig::default());
    h.availability.set(DriverAvailability {
        is_online: false,
        ..DriverAvailability::on_duty()
    });
    h.sync.start().await.unwrap();
    settle().await;
    let server = h.connector.take_server();
    drain(&mut h.events);

    server.push(new_order_frame("X9", None));
    server.push(json!({
        "type": "order_updated",
        "order": { "id": "X9", "status": "ready", "total": 30.0 }
    }));
    settle().await;

    let events = drain(&mut h.events);
    assert!(notified_ids(&events).is_empty());
    assert!(
        !events
            .iter()
            .any(|event| matches!(event, SyncEvent::OrderUpdated { .. }))
    );

    h.availability.set(DriverAvailability::on_duty());
    let snapshot = h.sync.snapshot();
    assert_eq!(
        snapshot.available_order("X9").map(|order| order.status),
        Some(OrderStatus::Ready)
    );

    // Once online, the next refresh surfaces the order exactly once.
    h.api.set_available(vec![Order::new("X9", OrderStatus::Ready)]);
    h.sync.refresh().await.unwrap();
    settle().await;
    assert_eq!(notified_ids(&drain(&mut h.events)), vec!["X9".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn accept_not_found_resolves_silently() {
    let mut h = harness(MockConnector::accepting(), SyncConfig::default());
    h.api.set_available(vec![Order::new("X", OrderStatus::Pending)]);
    h.sync.start().await.unwrap();
    settle().await;
    assert!(h.sync.snapshot().available_order("X").is_some());

    h.api.set_available(Vec::new());
    h.api.fail_actions_with(ApiError::NotFound);
    let outcome = h.sync.accept_order("X").await.unwrap();
    settle().await;

    assert_eq!(outcome, ActionOutcome::AlreadyResolved);
    assert!(h.sync.snapshot().available_order("X").is_none());
    assert!(h.sync.snapshot().assigned.is_empty());
    drain(&mut h.events);
}

#[tokio::test(start_paused = true)]
async fn accept_moves_order_to_assigned() {
    let h = harness(MockConnector::accepting(), SyncConfig::default());
    h.api.set_available(vec![Order::new("X", OrderStatus::Pending)]);
    h.sync.start().await.unwrap();
    settle().await;

    let outcome = h.sync.accept_order("X").await.unwrap();
    settle().await;

    assert_eq!(outcome, ActionOutcome::Completed);
    let snapshot = h.sync.snapshot();
    assert!(snapshot.available_order("X").is_none());
    assert_eq!(
        snapshot.assigned_order("X").map(|order| order.status),
        Some(OrderStatus::Assigned)
    );

    h.sync
        .update_order_status("X", OrderStatus::Delivered)
        .await
        .unwrap();
    settle().await;
    assert!(h.sync.snapshot().assigned.is_empty());
}

#[tokio::test(start_paused = true)]
async fn rejected_decline_surfaces_and_requests_refresh() {
    let h = harness(MockConnector::accepting(), SyncConfig::default());
    h.api.set_available(vec![Order::new("X", OrderStatus::Pending)]);
    h.sync.start().await.unwrap();
    settle().await;
    let fetches_before = h.api.fetches();

    h.api.fail_actions_with(ApiError::Status {
        status: 500,
        body: "boom".to_string(),
    });
    let result = h.sync.decline_order("X").await;
    settle().await;

    assert!(matches!(result, Err(ActionError::Rejected(ApiError::Status { status: 500, .. }))));
    assert_eq!(h.api.fetches(), fetches_before + 1);
    // The corrective refresh restores the still-available order.
    assert!(h.sync.snapshot().available_order("X").is_some());
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fall_back_to_polling_exclusively() {
    let config = SyncConfig {
        reconnect_max_attempts: 2,
        poll_interval: Duration::from_secs(15),
        ..SyncConfig::default()
    };
    let h = harness(MockConnector::refusing(), config);
    h.sync.start().await.unwrap();
    settle().await;

    let status = h.sync.status().await.unwrap();
    assert!(!status.polling);
    assert_eq!(status.connection, ConnectionState::Backoff);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(h.connector.attempts().len(), 3);
    let status = h.sync.status().await.unwrap();
    assert!(status.polling);
    assert_ne!(status.connection, ConnectionState::Connected);
    assert_eq!(h.metrics.polling_active.get(), 1);

    let fetches = h.api.fetches();
    tokio::time::sleep(Duration::from_secs(46)).await;
    assert_eq!(h.api.fetches(), fetches + 3);
    assert_eq!(h.connector.attempts().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn successful_connect_stops_polling() {
    let config = SyncConfig {
        reconnect_max_attempts: 0,
        ..SyncConfig::default()
    };
    let connector = MockConnector::accepting();
    connector.script(&[false]);
    let h = harness(connector, config);
    h.sync.start().await.unwrap();
    settle().await;
    assert!(h.sync.status().await.unwrap().polling);

    // A foreground transition restarts push-first.
    h.sync.enter_foreground().await.unwrap();
    settle().await;

    let status = h.sync.status().await.unwrap();
    assert_eq!(status.connection, ConnectionState::Connected);
    assert!(!status.polling);
    assert_eq!(h.metrics.polling_active.get(), 0);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_pings_on_interval() {
    let h = harness(MockConnector::accepting(), SyncConfig::default());
    h.sync.start().await.unwrap();
    settle().await;
    let mut server = h.connector.take_server();

    tokio::time::sleep(Duration::from_secs(95)).await;

    let pings: Vec<Value> = server
        .received()
        .into_iter()
        .filter_map(|frame| match frame {
            Outbound::Text(text) => serde_json::from_str(&text).ok(),
            Outbound::Close(_) => None,
        })
        .collect();
    assert_eq!(pings.len(), 3);
    assert!(pings.iter().all(|ping| ping["type"] == "ping"));
}

#[tokio::test(start_paused = true)]
async fn stop_leaves_no_timers_behind() {
    let mut h = harness(MockConnector::accepting(), SyncConfig::default());
    h.sync.start().await.unwrap();
    settle().await;
    let mut server = h.connector.take_server();

    h.sync.stop().await.unwrap();
    settle().await;

    assert_eq!(server.received(), vec![Outbound::Close(1000)]);
    let events = drain(&mut h.events);
    assert_eq!(
        events.last(),
        Some(&SyncEvent::ConnectionChanged { connected: false })
    );

    let attempts = h.connector.attempts().len();
    let fetches = h.api.fetches();
    tokio::time::sleep(Duration::from_secs(600)).await;

    assert!(server.received().is_empty());
    assert_eq!(h.connector.attempts().len(), attempts);
    assert_eq!(h.api.fetches(), fetches);
    assert!(drain(&mut h.events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn background_cancels_backoff_and_polling() {
    let config = SyncConfig {
        reconnect_max_attempts: 1,
        ..SyncConfig::default()
    };
    let h = harness(MockConnector::refusing(), config);
    h.sync.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(h.sync.status().await.unwrap().polling);

    h.sync.enter_background().await.unwrap();
    settle().await;
    let status = h.sync.status().await.unwrap();
    assert!(!status.polling);
    assert!(!status.active);

    let attempts = h.connector.attempts().len();
    let fetches = h.api.fetches();
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.connector.attempts().len(), attempts);
    assert_eq!(h.api.fetches(), fetches);
}

#[tokio::test(start_paused = true)]
async fn foreground_reopens_a_fresh_channel() {
    let h = harness(MockConnector::accepting(), SyncConfig::default());
    h.sync.start().await.unwrap();
    settle().await;
    let mut first = h.connector.take_server();

    h.sync.enter_background().await.unwrap();
    settle().await;
    assert_eq!(first.received(), vec![Outbound::Close(1000)]);
    assert!(!h.sync.snapshot().connected);

    h.sync.enter_foreground().await.unwrap();
    settle().await;
    assert_eq!(h.connector.attempts().len(), 2);
    assert!(h.sync.snapshot().connected);
}

#[tokio::test(start_paused = true)]
async fn disable_and_enable_gate_the_engine() {
    let h = harness(MockConnector::accepting(), SyncConfig::default());
    h.sync.start().await.unwrap();
    settle().await;

    h.sync.disable().await.unwrap();
    settle().await;
    assert!(!h.sync.snapshot().connected);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.connector.attempts().len(), 1);

    h.sync.enter_background().await.unwrap();
    h.sync.enable().await.unwrap();
    settle().await;
    assert_eq!(h.connector.attempts().len(), 1);

    h.sync.enter_foreground().await.unwrap();
    settle().await;
    assert_eq!(h.connector.attempts().len(), 2);
    assert!(h.sync.snapshot().connected);
}

#[tokio::test(start_paused = true)]
async fn start_twice_opens_one_channel() {
    let h = harness(MockConnector::accepting(), SyncConfig::default());
    h.sync.start().await.unwrap();
    h.sync.start().await.unwrap();
    settle().await;

    assert_eq!(h.connector.attempts().len(), 1);
    let url = h.connector.last_url().unwrap();
    assert_eq!(url.query(), Some("token=secret"));
}

#[tokio::test(start_paused = true)]
async fn missing_token_never_dials() {
    let h = harness(MockConnector::accepting(), SyncConfig::default());
    h.tokens.clear();
    h.sync.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(h.connector.attempts().is_empty());
    let status = h.sync.status().await.unwrap();
    assert_eq!(status.connection, ConnectionState::Backoff);
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_keep_the_channel_open() {
    let mut h = harness(MockConnector::accepting(), SyncConfig::default());
    h.sync.start().await.unwrap();
    settle().await;
    let server = h.connector.take_server();
    drain(&mut h.events);

    server
        .to_client
        .send(ChannelEvent::Message("{not json".to_string()))
        .unwrap();
    server.push(json!({ "type": "pong" }));
    server.push(json!({ "type": "order_cancelled", "order_id": "nope" }));
    server.push(new_order_frame("N1", None));
    settle().await;

    assert_eq!(notified_ids(&drain(&mut h.events)), vec!["N1".to_string()]);
    assert!(h.sync.snapshot().connected);
    assert_eq!(h.metrics.malformed_messages_total.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_removes_order_and_notifies_ui() {
    let mut h = harness(MockConnector::accepting(), SyncConfig::default());
    h.sync.start().await.unwrap();
    settle().await;
    let server = h.connector.take_server();

    server.push(new_order_frame("C1", None));
    server.push(json!({ "type": "order_cancelled", "order_id": "C1" }));
    settle().await;

    let events = drain(&mut h.events);
    assert!(events.contains(&SyncEvent::OrderRemoved {
        order_id: "C1".to_string()
    }));
    assert!(h.sync.snapshot().available.is_empty());
}

#[tokio::test(start_paused = true)]
async fn reset_session_forgets_seen_batches() {
    let mut h = harness(MockConnector::accepting(), SyncConfig::default());
    h.sync.start().await.unwrap();
    settle().await;
    let server = h.connector.take_server();

    server.push(new_order_frame("A1", Some("B1")));
    settle().await;
    h.sync.reset_session().await.unwrap();
    server.push(new_order_frame("A2", Some("B1")));
    settle().await;

    assert_eq!(
        notified_ids(&drain(&mut h.events)),
        vec!["A1".to_string(), "A2".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn accept_survives_a_refresh_fetched_before_it() {
    let h = harness(MockConnector::accepting(), SyncConfig::default());
    h.api.set_available(vec![Order::new("X", OrderStatus::Pending)]);
    h.sync.start().await.unwrap();
    settle().await;

    h.api.delay_fetches(Duration::from_secs(2));
    h.sync.refresh().await.unwrap();
    settle().await;

    assert_eq!(h.sync.accept_order("X").await.unwrap(), ActionOutcome::Completed);
    settle().await;
    assert!(h.sync.snapshot().assigned_order("X").is_some());

    tokio::time::sleep(Duration::from_secs(3)).await;
    let snapshot = h.sync.snapshot();
    assert!(snapshot.available_order("X").is_none());
    assert!(snapshot.assigned_order("X").is_some());

    tokio::time::sleep(Duration::from_secs(600)).await;
    let snapshot = h.sync.snapshot();
    assert!(snapshot.available_order("X").is_none());
    assert!(snapshot.assigned_order("X").is_some());
}

#[tokio::test(start_paused = true)]
async fn push_during_activation_refresh_is_kept() {
    let h = harness(MockConnector::accepting(), SyncConfig::default());
    h.api.delay_fetches(Duration::from_secs(2));
    h.sync.start().await.unwrap();
    settle().await;

    let server = h.connector.take_server();
    server.push(new_order_frame("N", None));
    settle().await;
    assert!(h.sync.snapshot().available_order("N").is_some());

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(h.sync.snapshot().available_order("N").is_some());
    assert!(h.sync.snapshot().connected);
}

#[tokio::test(start_paused = true)]
async fn corrective_refresh_queues_behind_a_stale_one() {
    let h = harness(MockConnector::accepting(), SyncConfig::default());
    h.api.set_available(vec![Order::new("X", OrderStatus::Pending)]);
    h.sync.start().await.unwrap();
    settle().await;

    h.api.delay_fetches(Duration::from_secs(2));
    h.sync.refresh().await.unwrap();
    settle().await;
    let fetches = h.api.fetches();

    h.api.fail_actions_with(ApiError::Status {
        status: 409,
        body: "conflict".to_string(),
    });
    assert!(h.sync.decline_order("X").await.is_err());
    h.api.clear_action_error();

    // The stale result replays the withdrawal; the queued refresh restores X.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(h.sync.snapshot().available_order("X").is_none());
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(h.api.fetches(), fetches + 1);
    assert!(h.sync.snapshot().available_order("X").is_some());
}

#[tokio::test(start_paused = true)]
async fn local_changes_reach_event_subscribers() {
    let mut h = harness(MockConnector::accepting(), SyncConfig::default());
    h.api.set_available(vec![
        Order::new("X", OrderStatus::Pending),
        Order::new("Y", OrderStatus::Pending),
    ]);
    h.sync.start().await.unwrap();
    settle().await;

    let events = drain(&mut h.events);
    let resynced = events.iter().rev().find_map(|event| match event {
        SyncEvent::Resynced { orders } => Some(orders.clone()),
        _ => None,
    });
    assert_eq!(resynced.map(|orders| orders.available.len()), Some(2));

    h.sync.accept_order("X").await.unwrap();
    h.sync.decline_order("Y").await.unwrap();
    settle().await;
    h.sync
        .update_order_status("X", OrderStatus::Delivered)
        .await
        .unwrap();
    settle().await;

    let events = drain(&mut h.events);
    let removed = |id: &str| SyncEvent::OrderRemoved {
        order_id: id.to_string(),
    };
    assert_eq!(
        events,
        vec![
            removed("X"),
            SyncEvent::OrderAssigned {
                order: Order::new("X", OrderStatus::Assigned)
            },
            removed("Y"),
            removed("X"),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn push_for_an_assigned_order_is_not_new_work() {
    let mut h = harness(MockConnector::accepting(), SyncConfig::default());
    h.api.set_assigned(vec![Order::new("Z", OrderStatus::Assigned)]);
    h.sync.start().await.unwrap();
    settle().await;
    let server = h.connector.take_server();
    drain(&mut h.events);

    server.push(new_order_frame("Z", None));
    settle().await;

    assert!(notified_ids(&drain(&mut h.events)).is_empty());
    let snapshot = h.sync.snapshot();
    assert!(snapshot.available_order("Z").is_none());
    assert!(snapshot.assigned_order("Z").is_some());
}

fn setup_app(h: &Harness) -> axum::Router {
    let state = AppState::new(
        h.sync.clone(),
        h.availability.clone(),
        h.tokens.clone(),
        h.metrics.clone(),
    );
    router(Arc::new(state))
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_connection_and_counts() {
    let h = harness(MockConnector::accepting(), SyncConfig::default());
    h.api.set_available(vec![Order::new("1", OrderStatus::Pending)]);
    h.sync.start().await.unwrap();
    h.sync.status().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let response = setup_app(&h).oneshot(get_request("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connected"], true);
    assert_eq!(body["delivery"], "push");
    assert_eq!(body["available"], 1);
    assert_eq!(body["assigned"], 0);
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let h = harness(MockConnector::accepting(), SyncConfig::default());
    let response = setup_app(&h).oneshot(get_request("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/plain"));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(body.contains("sync_connection_state"));
}

#[tokio::test]
async fn accept_not_found_over_http_is_ok() {
    let h = harness(MockConnector::accepting(), SyncConfig::default());
    h.api.fail_actions_with(ApiError::NotFound);
    h.sync.start().await.unwrap();

    let response = setup_app(&h)
        .oneshot(json_request("POST", "/orders/X/accept", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["order_id"], "X");
    assert_eq!(body["outcome"], "already_resolved");
}

#[tokio::test]
async fn rejected_action_over_http_is_bad_gateway() {
    let h = harness(MockConnector::accepting(), SyncConfig::default());
    h.api.fail_actions_with(ApiError::Unauthorized);
    h.sync.start().await.unwrap();

    let response = setup_app(&h)
        .oneshot(json_request(
            "PATCH",
            "/orders/X/status",
            json!({ "status": "picked_up" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("unauthorized"));
}

#[tokio::test]
async fn availability_can_be_updated() {
    let h = harness(MockConnector::accepting(), SyncConfig::default());
    let response = setup_app(&h)
        .oneshot(json_request(
            "PUT",
            "/driver/availability",
            json!({ "is_online": true, "is_available": false, "is_on_duty": true }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert!(!h.availability.availability().accepts_new_work());
}

#[tokio::test]
async fn empty_token_is_rejected() {
    let h = harness(MockConnector::accepting(), SyncConfig::default());
    let response = setup_app(&h)
        .oneshot(json_request("PUT", "/session/token", json!({ "token": " " })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn engine_status_endpoint_reflects_lifecycle() {
    let h = harness(MockConnector::accepting(), SyncConfig::default());
    let app = setup_app(&h);

    let response = app
        .clone()
        .oneshot(json_request("POST", "/engine/start", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = app
        .clone()
        .oneshot(json_request("POST", "/lifecycle/background", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = app.oneshot(get_request("/engine/status")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["active"], false);
    assert_eq!(body["foreground"], false);
    assert_eq!(body["connection"], "disconnected");
}
