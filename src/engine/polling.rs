use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::info;

/// Periodic full-refresh timer used while no push channel is connected.
pub struct PollingFallback {
    period: Duration,
    ticker: Option<Interval>,
}

impl PollingFallback {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            ticker: None,
        }
    }

    pub fn start(&mut self) {
        let period = self.period;
        let mut ticker = interval_at(Instant::now() + period, period);
        // Skipped ticks are dropped, never queued.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.ticker = Some(ticker);
        info!(interval_ms = period.as_millis() as u64, "polling fallback started");
    }

    pub fn stop(&mut self) {
        if self.ticker.take().is_some() {
            info!("polling fallback stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.ticker.is_some()
    }

    pub async fn tick(&mut self) {
        match self.ticker.as_mut() {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}
