//! bulkship - ships write operations to a document store cluster
//!
//! Data flows caller -> [`retry::Orchestrator`] -> [`bulk::BulkBatcher`] ->
//! [`pool::ConnectionPool`] -> [`transport::Transport`]; the orchestrator
//! makes every retry decision.

pub mod bulk;
pub mod cli;
pub mod config;
pub mod core;
pub mod pool;
pub mod retry;
pub mod transport;

pub use config::Config;
pub use core::Core;
