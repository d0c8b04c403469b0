use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bulk::{Action, BulkBatcher};
use crate::config::Config;
use crate::pool::{ClusterLicenseChecker, ConnectionPool};
use crate::retry::{
    DeadLetterSink, FileDeadLetterSink, Orchestrator, SubmitError, SubmitStatsSnapshot,
};
use crate::transport::{HyperTransport, Transport};

/// Pool, batcher and orchestrator wired from one validated [`Config`].
///
/// Clones share everything. `shutdown` is the root token: the orchestrator
/// watches it directly and the pool's background loops watch a child.
#[derive(Clone)]
pub struct Core {
    pub config: Arc<Config>,
    pub pool: ConnectionPool,
    pub orchestrator: Orchestrator,
    shutdown: CancellationToken,
}

impl Core {
    /// Build on the production HTTP transport
    pub async fn new(config: Config) -> Result<Self> {
        let transport = HyperTransport::new(&config.transport_config())
            .context("Failed to build HTTP transport")?;
        Self::with_transport(config, Arc::new(transport)).await
    }

    /// Build on any transport; used by `--dry-run` and tests
    pub async fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let shutdown = CancellationToken::new();

        let pool = ConnectionPool::new(
            transport,
            Arc::new(ClusterLicenseChecker),
            config.pool_config(),
            shutdown.child_token(),
        );

        let dead_letter: Option<Arc<dyn DeadLetterSink>> = match &config.retry.dead_letter_path {
            Some(path) => {
                let sink = FileDeadLetterSink::open(path)
                    .await
                    .with_context(|| format!("Failed to open dead letter file: {}", path))?;
                debug!(path = %path, "Dead letter file opened");
                Some(Arc::new(sink))
            }
            None => None,
        };

        let batcher = BulkBatcher::new(pool.clone(), config.batcher_config());
        let orchestrator = Orchestrator::new(
            batcher,
            config.retry_config(),
            dead_letter,
            shutdown.clone(),
        );

        Ok(Self {
            config,
            pool,
            orchestrator,
            shutdown,
        })
    }

    /// Register the configured hosts and launch the pool's background loops.
    ///
    /// Fails on bad credentials, missing privileges or an incompatible
    /// cluster.
    pub async fn start(&self) -> Result<()> {
        self.pool
            .start(&self.config.cluster.hosts)
            .await
            .context("Failed to register cluster hosts")
    }

    /// Send `actions` until every one is resolved or shutdown is requested.
    ///
    /// Returns the actions abandoned because of shutdown.
    pub async fn ship(&self, actions: Vec<Action>) -> Result<Vec<Action>, SubmitError> {
        self.orchestrator.retrying_submit(actions).await
    }

    pub fn stats(&self) -> SubmitStatsSnapshot {
        self.orchestrator.stats()
    }

    /// Token cancelled by [`Core::shutdown`]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop retry loops, then close the pool once in-flight requests finish
    pub async fn shutdown(&self) {
        self.orchestrator.stop();
        self.pool.close().await;
        info!("Shutdown complete");
    }
}
