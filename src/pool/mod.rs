//! Connection pool and endpoint health management
//!
//! This module provides:
//! - Endpoint registry with least-in-use selection and scoped leases
//! - Health checking ("resurrection") of endpoints that are not alive
//! - Version-bracketed compatibility detection and license checks
//! - Optional topology discovery ("sniffing")
//! - A cancellable periodic task used by the background loops

pub mod connection;
pub mod endpoint;
pub mod health;
pub mod license;
pub mod periodic;
pub mod sniffer;

pub use connection::{ConnectionGuard, ConnectionPool, PoolConfig, PoolError};
pub use endpoint::{BuildFlavor, Endpoint, EndpointState};
pub use health::{ProbeConfig, Version};
pub use license::{AlwaysAppropriate, ClusterLicenseChecker, LicenseChecker};
pub use periodic::PeriodicTask;
