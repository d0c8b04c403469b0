//! Transport adapter
//!
//! The pool talks to the cluster exclusively through the [`Transport`] trait:
//! one physical HTTP call per invocation, with connectivity failures reported
//! separately from bad-status responses. [`HyperTransport`] is the production
//! implementation, [`ScriptedTransport`] answers from memory.

pub mod client;
pub mod scripted;

pub use client::{HttpResponse, HyperTransport, Transport, TransportConfig, TransportError};
pub use scripted::{RecordedRequest, ScriptedTransport};
