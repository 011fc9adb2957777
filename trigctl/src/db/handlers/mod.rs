//! Database repositories. Each repository wraps a `&mut PgConnection` so it
//! works inside or outside a transaction.

pub mod fire_logs;
pub mod subscriptions;
pub mod webhooks;

pub use fire_logs::FireLogs;
pub use subscriptions::Subscriptions;
pub use webhooks::Webhooks;
