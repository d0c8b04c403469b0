//! Connection pool with health management
//!
//! This module provides the endpoint registry every request goes through:
//! - Least-in-use selection among alive endpoints, random tie-break
//! - Scoped acquisition: the in-use counter is released when the guard drops
//! - Periodic resurrection of dead endpoints and optional topology sniffing
//! - Graceful shutdown that waits for in-flight requests
//!
//! All metadata sits behind one mutex. The lock is never held across I/O.

use bytes::Bytes;
use chrono::Utc;
use hyper::{HeaderMap, Method, StatusCode};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::endpoint::{normalize_url, scheme_of, BuildFlavor, Endpoint, EndpointState};
use super::health::{api_version_headers, probe_endpoint, ProbeConfig, ProbeOutcome};
use super::license::LicenseChecker;
use super::periodic::PeriodicTask;
use super::sniffer;
use crate::transport::{HttpResponse, Transport, TransportError};

/// Error types for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("No available connections")]
    NoConnectionAvailable,

    #[error("Host unreachable: {url}: {message}")]
    HostUnreachable { url: String, message: String },

    #[error("Bad response code {status} from {url}")]
    BadResponseCode {
        status: StatusCode,
        url: String,
        body: Bytes,
    },

    /// Fatal problem found while registering endpoints
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Pool is closed")]
    Closed,
}

impl PoolError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            PoolError::BadResponseCode { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<TransportError> for PoolError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unreachable { url, message } => {
                PoolError::HostUnreachable { url, message }
            }
            TransportError::BadResponseCode { status, url, body } => {
                PoolError::BadResponseCode { status, url, body }
            }
            TransportError::InvalidRequest(message) => PoolError::InvalidRequest(message),
        }
    }
}

/// Configuration for pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub probe: ProbeConfig,

    /// Delay between resurrection passes
    pub resurrect_delay: Duration,

    /// Whether to discover peers through the nodes listing
    pub sniffing: bool,

    pub sniffing_delay: Duration,

    pub sniffing_path: String,

    /// How often `close` re-checks in-use counters
    pub shutdown_poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            probe: ProbeConfig::default(),
            resurrect_delay: Duration::from_secs(5),
            sniffing: false,
            sniffing_delay: Duration::from_secs(5),
            sniffing_path: "/_nodes/http".to_string(),
            shutdown_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Everything guarded by the pool lock
struct PoolState {
    endpoints: HashMap<String, Endpoint>,

    /// Never decreases
    maximum_seen_major_version: Option<u64>,

    /// Last flavor observed on any endpoint
    build_flavor: Option<BuildFlavor>,

    /// Scheme used for sniffed addresses
    scheme: String,

    closed: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    transport: Arc<dyn Transport>,
    license_checker: Arc<dyn LicenseChecker>,
    config: PoolConfig,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<PeriodicTask>>,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, url: &str) {
        let mut state = self.state();
        // A sniff may have removed the endpoint meanwhile
        if let Some(endpoint) = state.endpoints.get_mut(url) {
            endpoint.in_use = endpoint.in_use.saturating_sub(1);
        }
    }
}

/// A leased endpoint. Dropping it releases the lease.
pub struct ConnectionGuard {
    inner: Arc<PoolInner>,
    url: String,
}

impl ConnectionGuard {
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.release(&self.url);
    }
}

impl std::fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard").field("url", &self.url).finish()
    }
}

/// Endpoint registry and request chokepoint. Clone is cheap.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(
        transport: Arc<dyn Transport>,
        license_checker: Arc<dyn LicenseChecker>,
        config: PoolConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    endpoints: HashMap::new(),
                    maximum_seen_major_version: None,
                    build_flavor: None,
                    scheme: "http".to_string(),
                    closed: false,
                }),
                transport,
                license_checker,
                config,
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register the initial endpoints, run the registration health check and
    /// launch the background loops.
    ///
    /// Credential, privilege and compatibility problems found here are
    /// returned as [`PoolError::Configuration`].
    pub async fn start(&self, initial: &[String]) -> Result<(), PoolError> {
        if let Some(first) = initial.first() {
            self.inner.state().scheme = scheme_of(first).to_string();
        }

        let urls = initial
            .iter()
            .map(|raw| normalize_url(raw, scheme_of(raw)))
            .collect::<Result<Vec<_>, _>>()?;
        self.reconcile(urls);
        self.healthcheck(true).await?;

        self.spawn_resurrectionist();
        if self.inner.config.sniffing {
            if let Err(e) = self.sniff().await {
                warn!(error = %e, "Initial sniff failed");
            }
            self.spawn_sniffer();
        }

        info!(
            alive = self.alive_urls_count(),
            total = self.endpoint_snapshot().len(),
            "Connection pool started"
        );
        Ok(())
    }

    fn spawn_resurrectionist(&self) {
        let weak = Arc::downgrade(&self.inner);
        let task = PeriodicTask::spawn(
            "resurrectionist",
            self.inner.config.resurrect_delay,
            self.inner.shutdown.child_token(),
            move || {
                let pool = Self::upgrade(&weak);
                async move {
                    let Some(pool) = pool else { return };
                    if let Err(e) = pool.healthcheck(false).await {
                        warn!(error = %e, "Resurrection pass failed");
                    }
                }
            },
        );
        self.push_task(task);
    }

    fn spawn_sniffer(&self) {
        let weak = Arc::downgrade(&self.inner);
        let task = PeriodicTask::spawn(
            "sniffer",
            self.inner.config.sniffing_delay,
            self.inner.shutdown.child_token(),
            move || {
                let pool = Self::upgrade(&weak);
                async move {
                    let Some(pool) = pool else { return };
                    if let Err(e) = pool.sniff().await {
                        warn!(error = %e, "Error while sniffing connection");
                    }
                }
            },
        );
        self.push_task(task);
    }

    fn upgrade(weak: &Weak<PoolInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn push_task(&self, task: PeriodicTask) {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    /// Lease the alive endpoint with the fewest in-flight requests
    pub fn acquire(&self) -> Result<ConnectionGuard, PoolError> {
        let mut state = self.inner.state();
        if state.closed {
            return Err(PoolError::Closed);
        }

        let lowest = state
            .endpoints
            .values()
            .filter(|e| e.is_alive())
            .map(|e| e.in_use)
            .min()
            .ok_or(PoolError::NoConnectionAvailable)?;

        let eligible: Vec<&String> = state
            .endpoints
            .values()
            .filter(|e| e.is_alive() && e.in_use == lowest)
            .map(|e| &e.url)
            .collect();
        let url = eligible
            .choose(&mut rand::thread_rng())
            .map(|url| (*url).clone())
            .ok_or(PoolError::NoConnectionAvailable)?;

        if let Some(endpoint) = state.endpoints.get_mut(&url) {
            endpoint.in_use += 1;
        }

        Ok(ConnectionGuard {
            inner: Arc::clone(&self.inner),
            url,
        })
    }

    /// Release a lease explicitly
    pub fn release(&self, guard: ConnectionGuard) {
        drop(guard);
    }

    /// Move an endpoint to `Dead`; only a later health check revives it
    pub fn mark_dead(&self, url: &str, error: &str) {
        let mut state = self.inner.state();
        let Some(endpoint) = state.endpoints.get_mut(url) else {
            return;
        };
        warn!(url = %url, error = %error, "Marking url as dead");
        endpoint.mark_dead(error);
    }

    /// Headers every request must carry for the detected deployment
    pub fn request_headers(&self) -> HeaderMap {
        match self.inner.state().build_flavor {
            Some(BuildFlavor::Serverless) => api_version_headers(),
            _ => HeaderMap::new(),
        }
    }

    /// Perform a request on a leased endpoint.
    ///
    /// The lease is released on every path. Unreachable endpoints are marked
    /// dead; bad statuses are passed through without touching the endpoint.
    pub async fn perform_request(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<(String, HttpResponse), PoolError> {
        let guard = self.acquire()?;
        let result = self
            .perform_request_to_url(guard.url(), method, path, headers, body)
            .await;

        match result {
            Ok(response) => Ok((guard.url().to_string(), response)),
            Err(e @ PoolError::HostUnreachable { .. }) => {
                self.mark_dead(guard.url(), &e.to_string());
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Perform a request against a specific endpoint, without leasing it
    pub async fn perform_request_to_url(
        &self,
        url: &str,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<HttpResponse, PoolError> {
        let mut all_headers = self.request_headers();
        all_headers.extend(headers);
        let response = self
            .inner
            .transport
            .perform(url, method, path, &all_headers, body)
            .await?;
        Ok(response)
    }

    /// Probe every endpoint that is not alive and revive those that pass.
    ///
    /// With `register_phase` set, configuration problems abort the pass.
    pub async fn healthcheck(&self, register_phase: bool) -> Result<(), PoolError> {
        let candidates: Vec<String> = {
            let state = self.inner.state();
            state
                .endpoints
                .values()
                .filter(|e| !e.is_alive())
                .map(|e| e.url.clone())
                .collect()
        };

        for url in candidates {
            match self.check_endpoint(&url, register_phase).await {
                Ok(true) => {
                    self.set_alive(&url);
                }
                Ok(false) => {}
                Err(e @ PoolError::Configuration(_)) => return Err(e),
                Err(e) => {
                    warn!(
                        url = %url,
                        error = %e,
                        "Attempted to resurrect connection to dead node, but got an error"
                    );
                    self.record_error(&url, &e.to_string());
                }
            }
        }
        Ok(())
    }

    async fn check_endpoint(&self, url: &str, register_phase: bool) -> Result<bool, PoolError> {
        let headers = self.request_headers();
        let outcome = probe_endpoint(
            self.inner.transport.as_ref(),
            url,
            &self.inner.config.probe,
            &headers,
            register_phase,
        )
        .await?;
        self.record_version(url, &outcome);

        if !outcome.compatible {
            warn!(
                url = %url,
                version = %outcome.raw_version,
                "Node is not a compatible document store, it will not be used"
            );
            return Ok(false);
        }

        let headers = self.request_headers();
        Ok(self
            .inner
            .license_checker
            .appropriate(self.inner.transport.as_ref(), url, &headers)
            .await)
    }

    fn record_version(&self, url: &str, outcome: &ProbeOutcome) {
        let mut state = self.inner.state();
        let major = outcome.version.major;

        match state.maximum_seen_major_version {
            None => {
                info!(version = %outcome.raw_version, major, "Cluster version determined");
                state.maximum_seen_major_version = Some(major);
            }
            Some(seen) if major > seen => {
                warn!(
                    url = %url,
                    previous_major = seen,
                    major,
                    "Detected a node with a higher major version than previously observed, \
                     this could be the result of a cluster upgrade"
                );
                state.maximum_seen_major_version = Some(major);
            }
            Some(_) => {}
        }

        if outcome.build_flavor.is_some() {
            state.build_flavor = outcome.build_flavor.clone();
        }

        if let Some(endpoint) = state.endpoints.get_mut(url) {
            endpoint.version = Some(outcome.raw_version.clone());
            endpoint.build_flavor = outcome.build_flavor.clone();
        }
    }

    /// Returns the state the endpoint had before
    fn set_alive(&self, url: &str) -> Option<EndpointState> {
        let mut state = self.inner.state();
        let endpoint = state.endpoints.get_mut(url)?;
        let previous = std::mem::replace(&mut endpoint.state, EndpointState::Alive);
        if previous == EndpointState::Dead {
            warn!(url = %url, "Restored connection to cluster node");
        }
        Some(previous)
    }

    fn record_error(&self, url: &str, error: &str) {
        let mut state = self.inner.state();
        if let Some(endpoint) = state.endpoints.get_mut(url) {
            endpoint.last_error = Some(error.to_string());
            endpoint.last_errored_at = Some(Utc::now());
        }
    }

    /// Discover peers through an alive endpoint and reconcile the pool
    pub async fn sniff(&self) -> Result<(), PoolError> {
        let path = self.inner.config.sniffing_path.clone();
        let (url, response) = self
            .perform_request(Method::GET, &path, HeaderMap::new(), None)
            .await?;

        let scheme = self.inner.state().scheme.clone();
        let urls = sniffer::parse_nodes(&response.body, &scheme)?;
        debug!(via = %url, discovered = urls.len(), "Sniffed cluster topology");

        if urls.is_empty() {
            warn!("Sniff returned no nodes! Will not update hosts.");
            return Ok(());
        }
        self.update_urls(urls).await
    }

    /// Replace the endpoint set; any change triggers an inline health check
    pub async fn update_urls(&self, urls: Vec<String>) -> Result<(), PoolError> {
        if self.reconcile(urls) {
            self.healthcheck(false).await?;
        }
        Ok(())
    }

    /// Add missing endpoints as `Unknown`, drop vanished ones. Returns
    /// whether anything changed.
    fn reconcile(&self, urls: Vec<String>) -> bool {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        {
            let mut state = self.inner.state();
            for url in &urls {
                if !state.endpoints.contains_key(url) {
                    state
                        .endpoints
                        .insert(url.clone(), Endpoint::new(url.clone()));
                    added.push(url.clone());
                }
            }
            state.endpoints.retain(|url, _| {
                let keep = urls.contains(url);
                if !keep {
                    removed.push(url.clone());
                }
                keep
            });
        }

        let changed = !added.is_empty() || !removed.is_empty();
        if changed {
            info!(added = ?added, removed = ?removed, "Pool URLs updated");
        }
        changed
    }

    /// Stop background loops, wait for in-flight requests, close the transport
    pub async fn close(&self) {
        self.inner.state().closed = true;
        self.inner.shutdown.cancel();

        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            debug!(task = task.name(), "Stopping background task");
            task.stop().await;
        }

        debug!("Waiting for in use connections");
        loop {
            let busy: Vec<(String, u32)> = self
                .inner
                .state()
                .endpoints
                .values()
                .filter(|e| e.in_use > 0)
                .map(|e| (e.url.clone(), e.in_use))
                .collect();
            if busy.is_empty() {
                break;
            }
            info!(in_use = ?busy, "Blocked on shutdown to in use connections");
            tokio::time::sleep(self.inner.config.shutdown_poll_interval).await;
        }

        debug!("Closing transport");
        self.inner.transport.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    pub fn alive_urls_count(&self) -> usize {
        self.inner
            .state()
            .endpoints
            .values()
            .filter(|e| e.is_alive())
            .count()
    }

    /// Copy of every endpoint's metadata, sorted by URL
    pub fn endpoint_snapshot(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> =
            self.inner.state().endpoints.values().cloned().collect();
        endpoints.sort_by(|a, b| a.url.cmp(&b.url));
        endpoints
    }

    pub fn endpoint(&self, url: &str) -> Option<Endpoint> {
        self.inner.state().endpoints.get(url).cloned()
    }

    pub fn maximum_seen_major_version(&self) -> Option<u64> {
        self.inner.state().maximum_seen_major_version
    }

    pub fn build_flavor(&self) -> Option<BuildFlavor> {
        self.inner.state().build_flavor.clone()
    }
}
