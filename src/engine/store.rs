use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::engine::normalizer::OrderEvent;
use crate::models::order::Order;

/// Immutable view handed to readers; replaced wholesale on every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrdersSnapshot {
    pub available: Vec<Order>,
    pub assigned: Vec<Order>,
    pub connected: bool,
}

impl OrdersSnapshot {
    pub fn available_order(&self, id: &str) -> Option<&Order> {
        self.available.iter().find(|order| order.id == id)
    }

    pub fn assigned_order(&self, id: &str) -> Option<&Order> {
        self.assigned.iter().find(|order| order.id == id)
    }
}

/// A local mutation, kept while a full refresh is in flight so it can be
/// replayed over the (older) fetched lists.
#[derive(Debug, Clone)]
enum LocalChange {
    Push(OrderEvent),
    Withdraw(String),
    Assign(Order),
    UpdateAssigned(Order),
}

/// Sole owner of the driver-visible order collections.
pub struct OrderStore {
    available: Vec<Order>,
    assigned: Vec<Order>,
    connected: bool,
    in_flight: Option<Vec<LocalChange>>,
    publisher: watch::Sender<Arc<OrdersSnapshot>>,
}

impl OrderStore {
    pub fn new() -> (Self, watch::Receiver<Arc<OrdersSnapshot>>) {
        let (publisher, reader) = watch::channel(Arc::new(OrdersSnapshot::default()));
        (
            Self {
                available: Vec::new(),
                assigned: Vec::new(),
                connected: false,
                in_flight: None,
                publisher,
            },
            reader,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn contains(&self, id: &str) -> bool {
        position(&self.available, id).is_some() || position(&self.assigned, id).is_some()
    }

    /// Marks the point a full refresh was issued. Every change from here on
    /// is replayed over its result.
    pub fn begin_refresh(&mut self) {
        self.in_flight = Some(Vec::new());
    }

    pub fn abandon_refresh(&mut self) {
        self.in_flight = None;
    }

    /// Replaces both collections with fetched data, then re-applies local
    /// changes made since [`OrderStore::begin_refresh`].
    pub fn apply_full_refresh(&mut self, available: Vec<Order>, assigned: Vec<Order>) {
        self.available = available;
        self.assigned = assigned;

        if let Some(changes) = self.in_flight.take() {
            if !changes.is_empty() {
                debug!(changes = changes.len(), "replaying local changes over refresh");
            }
            for change in &changes {
                self.mutate(change);
            }
        }
        self.publish();
    }

    /// Returns whether the collections changed.
    pub fn apply_push_event(&mut self, event: &OrderEvent) -> bool {
        self.record(LocalChange::Push(event.clone()))
    }

    /// Optimistic removal ahead of an accept or decline call.
    pub fn withdraw(&mut self, id: &str) -> bool {
        self.record(LocalChange::Withdraw(id.to_string()))
    }

    pub fn assign(&mut self, order: Order) {
        self.record(LocalChange::Assign(order));
    }

    /// Terminal orders leave the assigned view.
    pub fn update_assigned(&mut self, order: Order) -> bool {
        self.record(LocalChange::UpdateAssigned(order))
    }

    pub fn forget(&mut self, id: &str) -> bool {
        self.record(LocalChange::Push(OrderEvent::OrderRemoved(id.to_string())))
    }

    pub fn set_connected(&mut self, connected: bool) {
        if self.connected != connected {
            self.connected = connected;
            self.publish();
        }
    }

    pub fn reset(&mut self) {
        self.available.clear();
        self.assigned.clear();
        self.in_flight = None;
        self.publish();
    }

    pub fn snapshot(&self) -> Arc<OrdersSnapshot> {
        self.publisher.borrow().clone()
    }

    fn record(&mut self, change: LocalChange) -> bool {
        let changed = self.mutate(&change);
        if let Some(changes) = self.in_flight.as_mut() {
            changes.push(change);
        }
        if changed {
            self.publish();
        }
        changed
    }

    fn mutate(&mut self, change: &LocalChange) -> bool {
        match change {
            LocalChange::Push(OrderEvent::NewOrder(order)) => {
                if self.contains(&order.id) {
                    false
                } else {
                    self.available.push(order.clone());
                    true
                }
            }
            LocalChange::Push(OrderEvent::OrderUpdated(order)) => {
                replace(&mut self.available, order) | replace(&mut self.assigned, order)
            }
            LocalChange::Push(OrderEvent::OrderRemoved(id)) => self.remove(id),
            LocalChange::Withdraw(id) => remove(&mut self.available, id),
            LocalChange::Assign(order) => {
                remove(&mut self.available, &order.id);
                upsert(&mut self.assigned, order.clone());
                true
            }
            LocalChange::UpdateAssigned(order) if order.status.is_terminal() => {
                self.remove(&order.id)
            }
            LocalChange::UpdateAssigned(order) => {
                upsert(&mut self.assigned, order.clone());
                true
            }
        }
    }

    fn remove(&mut self, id: &str) -> bool {
        remove(&mut self.available, id) | remove(&mut self.assigned, id)
    }

    fn publish(&self) {
        let snapshot = Arc::new(OrdersSnapshot {
            available: self.available.clone(),
            assigned: self.assigned.clone(),
            connected: self.connected,
        });
        self.publisher.send_replace(snapshot);
    }
}

fn position(orders: &[Order], id: &str) -> Option<usize> {
    orders.iter().position(|order| order.id == id)
}

fn replace(orders: &mut [Order], order: &Order) -> bool {
    match position(orders, &order.id) {
        Some(index) if orders[index] != *order => {
            orders[index] = order.clone();
            true
        }
        _ => false,
    }
}

fn upsert(orders: &mut Vec<Order>, order: Order) {
    match position(orders, &order.id) {
        Some(index) => orders[index] = order,
        None => orders.push(order),
    }
}

fn remove(orders: &mut Vec<Order>, id: &str) -> bool {
    let before = orders.len();
    orders.retain(|order| order.id != id);
    orders.len() != before
}
