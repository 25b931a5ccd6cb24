pub mod poller;
pub mod resolution;
pub mod scheduler;
pub mod subscriptions;
