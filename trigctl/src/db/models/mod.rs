pub mod fire_logs;
pub mod subscriptions;
pub mod webhooks;
