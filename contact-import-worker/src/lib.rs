pub mod api;
pub mod config;
pub mod context;
pub mod dedup;
pub mod error;
pub mod health;
pub mod job;
pub mod metrics_consts;
pub mod parse;
pub mod progress;
pub mod source;
pub mod store;
pub mod types;
pub mod writer;
