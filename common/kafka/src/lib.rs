pub mod client;
pub mod config;
pub mod kafka_consumer;
pub mod metrics_consts;
pub mod rebalance;
pub mod record;

pub use client::{ClientAdapter, Fetch, FetchError};
pub use record::Record;
