//! Storage gateway for reminders and notifications

mod connection;
mod migrations;
mod notifications;
mod pool;
mod reminders;

pub use connection::{Gateway, TransactionScope};
pub use notifications::NOTIFICATION_RETENTION_DAYS;
pub use pool::{GatewayPool, PooledGateway};
