use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

/// What the engine should do after a channel failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Inactive or disabled: stay disconnected, schedule nothing.
    Idle,
    /// Open a new session after the delay.
    Retry { attempt: u32, delay: Duration },
    /// Attempts exhausted: hand delivery over to polling.
    Fallback,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    state: ConnectionState,
    attempts: u32,
    base: Duration,
    cap: Duration,
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            base,
            cap,
            max_attempts,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn on_connecting(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    pub fn on_open(&mut self) {
        self.attempts = 0;
        self.state = ConnectionState::Connected;
    }

    /// Deliberate close or teardown. The attempt counter is kept so a
    /// server-initiated normal close does not look like a fresh start.
    pub fn on_closed(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.state = ConnectionState::Disconnected;
    }

    pub fn on_failure(&mut self, active: bool, enabled: bool) -> RetryDecision {
        if !active || !enabled {
            self.state = ConnectionState::Disconnected;
            return RetryDecision::Idle;
        }

        if self.attempts >= self.max_attempts {
            self.state = ConnectionState::Disconnected;
            return RetryDecision::Fallback;
        }

        let delay = self.delay_for(self.attempts);
        self.attempts += 1;
        self.state = ConnectionState::Backoff;

        RetryDecision::Retry {
            attempt: self.attempts,
            delay,
        }
    }

    /// min(base * 2^attempts, cap), saturating.
    fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}
