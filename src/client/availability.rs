use std::sync::RwLock;

use crate::client::AvailabilitySource;
use crate::models::driver::DriverAvailability;

/// Availability flags owned by the driver-profile side and read by the engine.
#[derive(Debug, Default)]
pub struct SharedAvailability {
    current: RwLock<DriverAvailability>,
}

impl SharedAvailability {
    pub fn new(initial: DriverAvailability) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    pub fn set(&self, availability: DriverAvailability) {
        if let Ok(mut guard) = self.current.write() {
            *guard = availability;
        }
    }
}

impl AvailabilitySource for SharedAvailability {
    fn availability(&self) -> DriverAvailability {
        self.current
            .read()
            .map(|guard| *guard)
            .unwrap_or_default()
    }
}
