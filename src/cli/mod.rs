//! CLI module for bulkship
//!
//! # Usage
//!
//! ```bash
//! # Ship NDJSON documents from a file into an index
//! bulkship ship --file events.ndjson --index logs
//!
//! # Ship from stdin, using a document field as the id
//! cat events.ndjson | bulkship ship --index logs --verb create --id-field event_id
//!
//! # Exercise batching and retries without a cluster
//! bulkship ship --file events.ndjson --dry-run
//!
//! # Show endpoint health
//! bulkship --config bulkship.yaml health
//! ```

pub mod commands;
pub mod input;

pub use commands::{cmd_health, cmd_ship, ship_from, ShipReport};
pub use input::{ActionTemplate, NdjsonSource};
