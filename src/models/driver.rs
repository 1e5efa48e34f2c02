use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriverAvailability {
    pub is_online: bool,
    pub is_available: bool,
    pub is_on_duty: bool,
}

impl DriverAvailability {
    pub fn on_duty() -> Self {
        Self {
            is_online: true,
            is_available: true,
            is_on_duty: true,
        }
    }

    /// New work is only surfaced when all three flags hold.
    pub fn accepts_new_work(&self) -> bool {
        self.is_online && self.is_available && self.is_on_duty
    }
}
