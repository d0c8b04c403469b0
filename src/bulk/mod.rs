//! Bulk actions and the size-bounded batcher
//!
//! - [`Action`]: one write operation and its NDJSON encoding
//! - [`BulkResponse`]: the per-item outcome returned by the cluster
//! - [`BulkBatcher`]: splits action lists into sub-requests under a byte budget

pub mod action;
pub mod batcher;
pub mod response;

pub use action::{document_from_bytes, Action, ActionParams, ScriptType, UpdateOptions, Verb};
pub use batcher::{
    BatcherConfig, BulkBatcher, BulkError, DEFAULT_BULK_PATH, EVENT_COUNT_HEADER,
    TARGET_BULK_BYTES, UNCOMPRESSED_LENGTH_HEADER,
};
pub use response::{BulkItem, BulkResponse, ItemError, ItemResult};
