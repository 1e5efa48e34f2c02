use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Keep-alive timer for an open channel. It never declares the channel dead
/// on its own; only the transport reports closure.
pub struct Heartbeat {
    period: Duration,
    ticker: Option<Interval>,
}

impl Heartbeat {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            ticker: None,
        }
    }

    /// Restarts the timer; any previous one is dropped first.
    pub fn start(&mut self) {
        self.stop();
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
    }

    pub fn stop(&mut self) {
        self.ticker = None;
    }

    pub fn is_active(&self) -> bool {
        self.ticker.is_some()
    }

    /// Resolves on the next ping time, or never when stopped.
    pub async fn tick(&mut self) {
        match self.ticker.as_mut() {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

pub fn ping_frame() -> String {
    json!({
        "type": "ping",
        "timestamp": Utc::now().timestamp_millis(),
    })
    .to_string()
}
