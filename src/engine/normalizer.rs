use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::models::order::Order;

/// Domain events carried by the push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderEvent {
    NewOrder(Order),
    OrderUpdated(Order),
    OrderRemoved(String),
}

impl OrderEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            OrderEvent::NewOrder(_) => "new_order",
            OrderEvent::OrderUpdated(_) => "order_updated",
            OrderEvent::OrderRemoved(_) => "order_removed",
        }
    }
}

/// Outcome of decoding one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(OrderEvent),
    Control,
    Ignored,
    Malformed,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    NewOrder {
        order: Order,
    },
    OrderUpdated {
        order: Order,
    },
    OrderCancelled {
        #[serde(default)]
        order_id: Option<String>,
        #[serde(default)]
        order: Option<RemovedOrder>,
    },
    Ping,
    Pong,
}

#[derive(Deserialize)]
struct RemovedOrder {
    id: String,
}

const KNOWN_TYPES: &[&str] = &["new_order", "order_updated", "order_cancelled", "ping", "pong"];

pub fn normalize(raw: &str) -> Inbound {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "dropping non-json channel frame");
            return Inbound::Malformed;
        }
    };

    let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_owned) else {
        warn!("dropping channel frame without a type");
        return Inbound::Malformed;
    };

    if !KNOWN_TYPES.contains(&kind.as_str()) {
        debug!(kind = %kind, "ignoring unknown channel message type");
        return Inbound::Ignored;
    }

    let frame = match serde_json::from_value::<Frame>(value) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, kind = %kind, "dropping malformed channel frame");
            return Inbound::Malformed;
        }
    };

    match frame {
        Frame::NewOrder { order } => Inbound::Event(OrderEvent::NewOrder(order)),
        Frame::OrderUpdated { order } => Inbound::Event(OrderEvent::OrderUpdated(order)),
        Frame::OrderCancelled { order_id, order } => {
            match order_id.or_else(|| order.map(|removed| removed.id)) {
                Some(id) => Inbound::Event(OrderEvent::OrderRemoved(id)),
                None => {
                    warn!("dropping order_cancelled frame without an order id");
                    Inbound::Malformed
                }
            }
        }
        Frame::Ping | Frame::Pong => Inbound::Control,
    }
}
