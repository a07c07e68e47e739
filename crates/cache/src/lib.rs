#![warn(clippy::unwrap_used)]

pub mod client;
pub mod local;
pub mod queue;
pub mod store;

pub use client::RedisCounterStore;
pub use local::LocalCounterStore;
pub use queue::{QueueKeys, RedisDelayedQueue};
pub use store::CounterStore;
