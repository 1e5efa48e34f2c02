pub mod coalescer;
pub mod heartbeat;
pub mod lifecycle;
pub mod normalizer;
pub mod polling;
pub mod reconnect;
pub mod store;
pub mod sync;
pub mod transport;
