use std::collections::HashSet;

use crate::models::driver::DriverAvailability;
use crate::models::order::Order;

/// Why a new order did or did not surface to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// First order of an unseen batch; it represents the whole batch.
    NotifyBatch,
    /// Unbatched order not surfaced before.
    NotifyOrder,
    /// Batch already surfaced.
    SeenBatch,
    /// Unbatched order already surfaced.
    SeenOrder,
    /// Driver is not online, available and on duty.
    Unavailable,
}

impl Verdict {
    pub fn notifies(self) -> bool {
        matches!(self, Verdict::NotifyBatch | Verdict::NotifyOrder)
    }
}

/// Tracks which orders and batches were already surfaced during one driver
/// session. Both sets only grow until `reset`.
#[derive(Debug, Default)]
pub struct NotificationCoalescer {
    seen_orders: HashSet<String>,
    seen_batches: HashSet<String>,
}

impl NotificationCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decide(&mut self, order: &Order, availability: DriverAvailability) -> Verdict {
        if !availability.accepts_new_work() {
            return Verdict::Unavailable;
        }

        let verdict = match &order.batch_id {
            Some(batch_id) => {
                if self.seen_batches.insert(batch_id.clone()) {
                    Verdict::NotifyBatch
                } else {
                    Verdict::SeenBatch
                }
            }
            None if self.seen_orders.contains(&order.id) => Verdict::SeenOrder,
            None => Verdict::NotifyOrder,
        };

        self.seen_orders.insert(order.id.clone());
        verdict
    }

    pub fn has_seen_order(&self, id: &str) -> bool {
        self.seen_orders.contains(id)
    }

    pub fn has_seen_batch(&self, batch_id: &str) -> bool {
        self.seen_batches.contains(batch_id)
    }

    pub fn reset(&mut self) {
        self.seen_orders.clear();
        self.seen_batches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::{NotificationCoalescer, Verdict};
    use crate::models::driver::DriverAvailability;
    use crate::models::order::{Order, OrderStatus};

    fn order(id: &str) -> Order {
        Order::new(id, OrderStatus::Pending)
    }

    #[test]
    fn batch_notifies_once_for_first_order() {
        let mut coalescer = NotificationCoalescer::new();
        let on = DriverAvailability::on_duty();

        assert_eq!(coalescer.decide(&order("1").with_batch("B1"), on), Verdict::NotifyBatch);
        assert_eq!(coalescer.decide(&order("2").with_batch("B1"), on), Verdict::SeenBatch);
        assert_eq!(coalescer.decide(&order("3").with_batch("B1"), on), Verdict::SeenBatch);
        assert_eq!(coalescer.decide(&order("4").with_batch("B2"), on), Verdict::NotifyBatch);
        assert!(coalescer.has_seen_order("2"));
    }

    #[test]
    fn unbatched_order_notifies_once() {
        let mut coalescer = NotificationCoalescer::new();
        let on = DriverAvailability::on_duty();

        assert_eq!(coalescer.decide(&order("1"), on), Verdict::NotifyOrder);
        assert_eq!(coalescer.decide(&order("1"), on), Verdict::SeenOrder);
    }

    #[test]
    fn any_missing_flag_suppresses_and_marks_nothing() {
        let mut coalescer = NotificationCoalescer::new();
        let off_duty = DriverAvailability {
            is_on_duty: false,
            ..DriverAvailability::on_duty()
        };

        assert_eq!(
            coalescer.decide(&order("1").with_batch("B1"), off_duty),
            Verdict::Unavailable
        );
        assert!(!coalescer.has_seen_order("1"));
        assert!(!coalescer.has_seen_batch("B1"));

        let on = DriverAvailability::on_duty();
        assert_eq!(coalescer.decide(&order("1").with_batch("B1"), on), Verdict::NotifyBatch);
    }

    #[test]
    fn reset_forgets_everything() {
        let mut coalescer = NotificationCoalescer::new();
        let on = DriverAvailability::on_duty();
        coalescer.decide(&order("1").with_batch("B1"), on);
        coalescer.reset();
        assert!(!coalescer.has_seen_batch("B1"));
        assert_eq!(coalescer.decide(&order("2").with_batch("B1"), on), Verdict::NotifyBatch);
    }
}
