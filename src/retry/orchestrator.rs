use hyper::StatusCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::dead_letter::DeadLetterSink;
use crate::bulk::{Action, BulkBatcher, BulkError, BulkItem};
use crate::pool::PoolError;

pub const SUCCESS_CODES: [u16; 2] = [200, 201];
pub const CONFLICT_CODE: u16 = 409;
pub const DEAD_LETTER_CODES: [u16; 2] = [400, 404];

/// Logged at error level instead of warn when routed nowhere
const INVALID_INDEX_NAME: &str = "invalid_index_name_exception";

#[derive(Error, Debug)]
pub enum SubmitError {
    /// The bulk call failed as a whole
    #[error(transparent)]
    Request(#[from] BulkError),

    #[error("sent {sent} actions but the bulk response has {received} items")]
    ItemCountMismatch { sent: usize, received: usize },
}

impl SubmitError {
    /// Whether the same action list may simply be sent again later
    pub fn is_retryable(&self) -> bool {
        match self {
            SubmitError::Request(BulkError::Pool(e)) => matches!(
                e,
                PoolError::HostUnreachable { .. }
                    | PoolError::NoConnectionAvailable
                    | PoolError::BadResponseCode { .. }
                    | PoolError::InvalidResponse(_)
            ),
            SubmitError::Request(BulkError::Decode(_)) => true,
            _ => false,
        }
    }

    /// The pool refused the request because it is shutting down
    pub fn is_pool_closed(&self) -> bool {
        matches!(self, SubmitError::Request(BulkError::Pool(PoolError::Closed)))
    }
}

/// What happens to one document after its item came back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Success,
    /// Version conflict, dropped
    Conflict,
    DeadLetter,
    Retry,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,

    /// Added to [`DEAD_LETTER_CODES`]
    pub dlq_custom_codes: Vec<u16>,

    /// Error types whose failures are not logged
    pub silence_errors_in_log: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(64),
            dlq_custom_codes: Vec::new(),
            silence_errors_in_log: Vec::new(),
        }
    }
}

impl RetryConfig {
    pub fn disposition(&self, status: u16) -> Disposition {
        if SUCCESS_CODES.contains(&status) {
            Disposition::Success
        } else if status == CONFLICT_CODE {
            Disposition::Conflict
        } else if DEAD_LETTER_CODES.contains(&status) || self.dlq_custom_codes.contains(&status) {
            Disposition::DeadLetter
        } else {
            Disposition::Retry
        }
    }

    fn is_silenced(&self, item: &BulkItem) -> bool {
        item.error_type()
            .is_some_and(|kind| self.silence_errors_in_log.iter().any(|s| s == kind))
    }
}

/// Submission counters, shared between clones of the orchestrator
#[derive(Debug, Default)]
pub struct SubmitStats {
    pub bulk_successes: AtomicU64,
    pub bulk_with_errors: AtomicU64,
    pub bulk_failures: AtomicU64,
    pub document_successes: AtomicU64,
    pub non_retryable_failures: AtomicU64,
    pub dlq_routed: AtomicU64,
    pub retryable_failures: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitStatsSnapshot {
    pub bulk_successes: u64,
    pub bulk_with_errors: u64,
    pub bulk_failures: u64,
    pub document_successes: u64,
    pub non_retryable_failures: u64,
    pub dlq_routed: u64,
    pub retryable_failures: u64,
}

impl SubmitStats {
    pub fn snapshot(&self) -> SubmitStatsSnapshot {
        SubmitStatsSnapshot {
            bulk_successes: self.bulk_successes.load(Ordering::Relaxed),
            bulk_with_errors: self.bulk_with_errors.load(Ordering::Relaxed),
            bulk_failures: self.bulk_failures.load(Ordering::Relaxed),
            document_successes: self.document_successes.load(Ordering::Relaxed),
            non_retryable_failures: self.non_retryable_failures.load(Ordering::Relaxed),
            dlq_routed: self.dlq_routed.load(Ordering::Relaxed),
            retryable_failures: self.retryable_failures.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// `<verb> <params json>`, used in logs and dead-letter reasons
fn describe(action: &Action) -> String {
    let params = serde_json::to_string(&action.params).unwrap_or_default();
    format!("{} {}", action.verb, params)
}

fn item_json(item: &BulkItem) -> String {
    serde_json::to_string(item).unwrap_or_default()
}

/// Classifies bulk outcomes and drives retries.
///
/// Clone is cheap; clones share counters and the shutdown token.
#[derive(Clone)]
pub struct Orchestrator {
    batcher: BulkBatcher,
    config: RetryConfig,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    stats: Arc<SubmitStats>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        batcher: BulkBatcher,
        config: RetryConfig,
        dead_letter: Option<Arc<dyn DeadLetterSink>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            batcher,
            config,
            dead_letter,
            stats: Arc::new(SubmitStats::default()),
            shutdown,
        }
    }

    pub fn stats(&self) -> SubmitStatsSnapshot {
        self.stats.snapshot()
    }

    /// Ask running retry loops to give up at their next wait
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Send `actions` once and return those that should be sent again.
    ///
    /// Conflicts and dead-lettered documents are resolved here and never
    /// returned. Request-level failures come back as [`SubmitError::Request`];
    /// an item count that differs from `actions.len()` is
    /// [`SubmitError::ItemCountMismatch`].
    pub async fn submit(&self, actions: &[Action]) -> Result<Vec<Action>, SubmitError> {
        let response = match self.batcher.bulk(actions).await {
            Ok(response) => response,
            Err(e) => {
                bump(&self.stats.bulk_failures, 1);
                return Err(e.into());
            }
        };

        if !response.errors {
            bump(&self.stats.bulk_successes, 1);
            bump(&self.stats.document_successes, actions.len() as u64);
            return Ok(Vec::new());
        }
        bump(&self.stats.bulk_with_errors, 1);

        if response.items.len() != actions.len() {
            error!(
                sent = actions.len(),
                received = response.items.len(),
                "Bulk response item count does not match the submitted actions"
            );
            return Err(SubmitError::ItemCountMismatch {
                sent: actions.len(),
                received: response.items.len(),
            });
        }

        let mut to_retry = Vec::new();
        for (action, item) in actions.iter().zip(&response.items) {
            let status = item.status();
            match self.config.disposition(status) {
                Disposition::Success => bump(&self.stats.document_successes, 1),
                Disposition::Conflict => {
                    bump(&self.stats.non_retryable_failures, 1);
                    if !self.config.is_silenced(item) {
                        warn!(
                            status,
                            action = %describe(action),
                            response = %item_json(item),
                            "Failed action"
                        );
                    }
                }
                Disposition::DeadLetter => self.dead_letter(action, item).await,
                Disposition::Retry => {
                    bump(&self.stats.retryable_failures, 1);
                    if !self.config.is_silenced(item) {
                        info!(
                            status,
                            action = %describe(action),
                            error = ?item.error(),
                            "Retrying failed action"
                        );
                    }
                    to_retry.push(action.clone());
                }
            }
        }

        Ok(to_retry)
    }

    async fn dead_letter(&self, action: &Action, item: &BulkItem) {
        let status = item.status();
        let reason = format!(
            "Could not index event. status: {}, action: {}, response: {}",
            status,
            describe(action),
            item_json(item)
        );

        let Some(sink) = &self.dead_letter else {
            bump(&self.stats.non_retryable_failures, 1);
            if item.error_type() == Some(INVALID_INDEX_NAME) {
                error!(status, action = %describe(action), response = %item_json(item), "Could not index event");
            } else {
                warn!(status, action = %describe(action), response = %item_json(item), "Could not index event");
            }
            return;
        };

        match sink.write(action, &reason).await {
            Ok(()) => bump(&self.stats.dlq_routed, 1),
            Err(e) => {
                bump(&self.stats.non_retryable_failures, 1);
                error!(error = %e, reason = %reason, "Failed to write event to the dead letter sink");
            }
        }
    }

    /// Submit until nothing is left to retry.
    ///
    /// Retryable request failures resend the same list after a backoff that
    /// doubles per unsuccessful pass. Returns the actions still pending when
    /// shutdown or a closed pool interrupted the loop, an empty list otherwise.
    pub async fn retrying_submit(&self, actions: Vec<Action>) -> Result<Vec<Action>, SubmitError> {
        let mut remaining = actions;
        let mut backoff = Backoff::new(self.config.initial_interval, self.config.max_interval);

        while !remaining.is_empty() {
            if self.is_stopping() {
                info!(count = remaining.len(), "Shutdown requested, abandoning pending actions");
                return Ok(remaining);
            }

            match self.submit(&remaining).await {
                Ok(to_retry) => {
                    remaining = to_retry;
                    if remaining.is_empty() {
                        break;
                    }
                    info!(
                        count = remaining.len(),
                        "Retrying individual bulk actions that failed or were rejected by the previous bulk request"
                    );
                }
                Err(e) if e.is_pool_closed() || self.is_stopping() => {
                    info!(
                        count = remaining.len(),
                        error = %e,
                        "Shutdown requested, abandoning pending actions"
                    );
                    return Ok(remaining);
                }
                Err(e) if e.is_retryable() => self.log_request_failure(&e, backoff.peek()),
                Err(e) => return Err(e),
            }

            let interval = backoff.next_interval();
            if !self.interruptible_sleep(interval).await {
                info!(count = remaining.len(), "Shutdown requested, abandoning pending actions");
                return Ok(remaining);
            }
        }

        Ok(remaining)
    }

    fn log_request_failure(&self, e: &SubmitError, next: Duration) {
        let will_retry_in_seconds = next.as_secs();
        let SubmitError::Request(BulkError::Pool(pool_error)) = e else {
            error!(error = %e, will_retry_in_seconds, "An unknown error occurred sending a bulk request (will retry indefinitely)");
            return;
        };

        match pool_error {
            PoolError::HostUnreachable { url, message } => error!(
                url = %url,
                error = %message,
                will_retry_in_seconds,
                "Attempted to send a bulk request but the cluster appears to be unreachable or down"
            ),
            PoolError::NoConnectionAvailable => error!(
                will_retry_in_seconds,
                "Attempted to send a bulk request but there are no living connections in the pool"
            ),
            PoolError::BadResponseCode { status, url, .. }
                if *status == StatusCode::TOO_MANY_REQUESTS =>
            {
                debug!(
                    status = status.as_u16(),
                    url = %url,
                    will_retry_in_seconds,
                    "Encountered a retryable error (will retry with exponential backoff)"
                )
            }
            PoolError::BadResponseCode { status, url, body } => error!(
                status = status.as_u16(),
                url = %url,
                body = %String::from_utf8_lossy(body),
                will_retry_in_seconds,
                "Encountered a retryable error (will retry with exponential backoff)"
            ),
            other => error!(
                error = %other,
                will_retry_in_seconds,
                "An unknown error occurred sending a bulk request (will retry indefinitely)"
            ),
        }
    }

    /// Sleep unless shutdown comes first; false when interrupted
    async fn interruptible_sleep(&self, interval: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(interval) => true,
        }
    }
}
