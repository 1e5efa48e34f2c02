use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub connection_state: IntGauge,
    pub polling_active: IntGauge,
    pub reconnect_attempts_total: IntCounter,
    pub events_total: IntCounterVec,
    pub notifications_total: IntCounterVec,
    pub refresh_total: IntCounterVec,
    pub malformed_messages_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let connection_state = IntGauge::new(
            "sync_connection_state",
            "Push channel state (1 connected, 0 otherwise)",
        )
        .expect("valid sync_connection_state metric");

        let polling_active = IntGauge::new(
            "sync_polling_active",
            "Whether the polling fallback is running",
        )
        .expect("valid sync_polling_active metric");

        let reconnect_attempts_total = IntCounter::new(
            "sync_reconnect_attempts_total",
            "Reconnection attempts scheduled by the backoff policy",
        )
        .expect("valid sync_reconnect_attempts_total metric");

        let events_total = IntCounterVec::new(
            Opts::new("sync_events_total", "Order events received by kind"),
            &["kind"],
        )
        .expect("valid sync_events_total metric");

        let notifications_total = IntCounterVec::new(
            Opts::new("sync_notifications_total", "New-work notifications by kind"),
            &["kind"],
        )
        .expect("valid sync_notifications_total metric");

        let refresh_total = IntCounterVec::new(
            Opts::new("sync_refresh_total", "Full refreshes by outcome"),
            &["outcome"],
        )
        .expect("valid sync_refresh_total metric");

        let malformed_messages_total = IntCounter::new(
            "sync_malformed_messages_total",
            "Inbound channel frames that failed to parse",
        )
        .expect("valid sync_malformed_messages_total metric");

        registry
            .register(Box::new(connection_state.clone()))
            .expect("register sync_connection_state");
        registry
            .register(Box::new(polling_active.clone()))
            .expect("register sync_polling_active");
        registry
            .register(Box::new(reconnect_attempts_total.clone()))
            .expect("register sync_reconnect_attempts_total");
        registry
            .register(Box::new(events_total.clone()))
            .expect("register sync_events_total");
        registry
            .register(Box::new(notifications_total.clone()))
            .expect("register sync_notifications_total");
        registry
            .register(Box::new(refresh_total.clone()))
            .expect("register sync_refresh_total");
        registry
            .register(Box::new(malformed_messages_total.clone()))
            .expect("register sync_malformed_messages_total");

        Self {
            registry,
            connection_state,
            polling_active,
            reconnect_attempts_total,
            events_total,
            notifications_total,
            refresh_total,
            malformed_messages_total,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
