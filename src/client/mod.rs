//! Collaborators the sync engine consumes: the order REST API, the session
//! token and the driver's availability flags.

pub mod availability;
pub mod http;
pub mod token;

use async_trait::async_trait;

use crate::error::ApiError;
use crate::models::driver::DriverAvailability;
use crate::models::order::{Order, OrderStatus};

#[async_trait]
pub trait OrderApi: Send + Sync {
    async fn fetch_available_orders(&self) -> Result<Vec<Order>, ApiError>;

    async fn fetch_assigned_orders(&self) -> Result<Vec<Order>, ApiError>;

    async fn accept_order(&self, id: &str) -> Result<Order, ApiError>;

    async fn decline_order(&self, id: &str) -> Result<(), ApiError>;

    async fn update_order_status(&self, id: &str, status: OrderStatus) -> Result<Order, ApiError>;
}

pub trait TokenProvider: Send + Sync {
    fn auth_token(&self) -> Option<String>;
}

pub trait AvailabilitySource: Send + Sync {
    fn availability(&self) -> DriverAvailability;
}
