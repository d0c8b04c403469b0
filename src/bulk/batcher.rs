//! Size-bounded bulk requests
//!
//! Actions are serialized to NDJSON into a running buffer, optionally gzip
//! compressed. When the next action would push the uncompressed size over
//! the budget the buffer is sent as its own sub-request. The sub-responses
//! are stitched back into one [`BulkResponse`] in submission order.

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use hyper::header::{HeaderName, HeaderValue, CONTENT_ENCODING};
use hyper::{HeaderMap, Method, StatusCode};
use std::io::Write;
use thiserror::Error;
use tracing::{debug, warn};

use super::action::{Action, UpdateOptions, Verb};
use super::response::BulkResponse;
use crate::pool::{ConnectionPool, PoolError};

/// Number of actions in a sub-request
pub const EVENT_COUNT_HEADER: &str = "x-elastic-event-count";

/// Pre-compression size of a sub-request body
pub const UNCOMPRESSED_LENGTH_HEADER: &str = "x-elastic-uncompressed-request-length";

pub const TARGET_BULK_BYTES: usize = 20 * 1024 * 1024;

pub const DEFAULT_BULK_PATH: &str = "/_bulk?filter_path=errors,items.*.error,items.*.status";

/// Reason carried by items of a sub-request rejected with 413
pub const PAYLOAD_TOO_LARGE_REASON: &str = "payload_too_large";

#[derive(Error, Debug)]
pub enum BulkError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("failed to decode bulk response: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to serialize action: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BulkError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            BulkError::Pool(e) => e.status(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Upper bound on the uncompressed size of one sub-request
    pub target_bulk_bytes: usize,

    /// gzip level, 0 disables compression
    pub compression_level: u32,

    pub bulk_path: String,

    pub update: UpdateOptions,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            target_bulk_bytes: TARGET_BULK_BYTES,
            compression_level: 1,
            bulk_path: DEFAULT_BULK_PATH.to_string(),
            update: UpdateOptions::default(),
        }
    }
}

enum BodyWriter {
    Plain(Vec<u8>),
    Gzip(GzEncoder<Vec<u8>>),
}

/// Buffer for the sub-request being assembled
struct SubBatch {
    writer: BodyWriter,
    uncompressed_len: usize,
    verbs: Vec<Verb>,
}

impl SubBatch {
    fn new(compression_level: u32) -> Self {
        let writer = if compression_level > 0 {
            BodyWriter::Gzip(GzEncoder::new(
                Vec::new(),
                Compression::new(compression_level),
            ))
        } else {
            BodyWriter::Plain(Vec::new())
        };
        Self {
            writer,
            uncompressed_len: 0,
            verbs: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.uncompressed_len == 0
    }

    fn is_compressed(&self) -> bool {
        matches!(self.writer, BodyWriter::Gzip(_))
    }

    fn push(&mut self, line: &[u8], verb: Verb) -> std::io::Result<()> {
        match &mut self.writer {
            BodyWriter::Plain(buf) => buf.extend_from_slice(line),
            BodyWriter::Gzip(encoder) => encoder.write_all(line)?,
        }
        self.uncompressed_len += line.len();
        self.verbs.push(verb);
        Ok(())
    }

    fn finish(self) -> std::io::Result<(Bytes, usize, Vec<Verb>)> {
        let body = match self.writer {
            BodyWriter::Plain(buf) => buf,
            BodyWriter::Gzip(encoder) => encoder.finish()?,
        };
        Ok((Bytes::from(body), self.uncompressed_len, self.verbs))
    }
}

/// Splits action lists into byte-bounded bulk sub-requests
#[derive(Clone)]
pub struct BulkBatcher {
    pool: ConnectionPool,
    config: BatcherConfig,
}

impl BulkBatcher {
    pub fn new(pool: ConnectionPool, config: BatcherConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.config
    }

    /// Send `actions` and return one logical response covering all of them.
    ///
    /// Request-level failures other than 413 are returned as errors; a 413
    /// becomes one failed item per action of the rejected sub-request.
    pub async fn bulk(&self, actions: &[Action]) -> Result<BulkResponse, BulkError> {
        if actions.is_empty() {
            return Ok(BulkResponse::default());
        }

        let level = self.config.compression_level;
        let mut responses = Vec::new();
        let mut batch = SubBatch::new(level);

        for (index, action) in actions.iter().enumerate() {
            let line = action
                .to_ndjson(&self.config.update)
                .map_err(BulkError::Serialize)?;

            if batch.uncompressed_len + line.len() > self.config.target_bulk_bytes
                && !batch.is_empty()
            {
                debug!(
                    action_count = batch.verbs.len(),
                    payload_size = batch.uncompressed_len,
                    batch_offset = index - batch.verbs.len(),
                    "Sending partial bulk request for batch with one or more actions remaining"
                );
                let full = std::mem::replace(&mut batch, SubBatch::new(level));
                responses.push(self.send(full).await?);
            }

            batch.push(&line, action.verb)?;
        }

        if !batch.is_empty() {
            debug!(
                action_count = batch.verbs.len(),
                payload_size = batch.uncompressed_len,
                "Sending final bulk request for batch"
            );
            responses.push(self.send(batch).await?);
        }

        Ok(BulkResponse::join(responses))
    }

    async fn send(&self, batch: SubBatch) -> Result<BulkResponse, BulkError> {
        let compressed = batch.is_compressed();
        let (body, uncompressed_len, verbs) = batch.finish()?;
        let content_length = body.len();

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(EVENT_COUNT_HEADER),
            HeaderValue::from(verbs.len()),
        );
        headers.insert(
            HeaderName::from_static(UNCOMPRESSED_LENGTH_HEADER),
            HeaderValue::from(uncompressed_len),
        );
        if compressed {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }

        let result = self
            .pool
            .perform_request(Method::POST, &self.config.bulk_path, headers, Some(body))
            .await;

        match result {
            Ok((url, response)) if !response.status.is_success() => {
                Err(BulkError::Pool(PoolError::BadResponseCode {
                    status: response.status,
                    url: format!("{}{}", url, self.config.bulk_path),
                    body: response.body,
                }))
            }
            Ok((_, response)) => BulkResponse::parse(&response.body).map_err(BulkError::Decode),
            Err(e) if e.status() == Some(StatusCode::PAYLOAD_TOO_LARGE) => {
                warn!(
                    action_count = verbs.len(),
                    content_length,
                    "Bulk request rejected: `413 Payload Too Large`"
                );
                Ok(BulkResponse::rejected_batch(
                    &verbs,
                    StatusCode::PAYLOAD_TOO_LARGE.as_u16(),
                    PAYLOAD_TOO_LARGE_REASON,
                ))
            }
            Err(e) => Err(BulkError::Pool(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::action::ActionParams;
    use crate::pool::{AlwaysAppropriate, PoolConfig};
    use crate::transport::scripted::{bulk_response, cluster_response, RecordedRequest};
    use crate::transport::{HttpResponse, ScriptedTransport, TransportError};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    async fn batcher_with(
        transport: Arc<ScriptedTransport>,
        config: BatcherConfig,
    ) -> BulkBatcher {
        let pool = ConnectionPool::new(
            transport,
            Arc::new(AlwaysAppropriate),
            PoolConfig::default(),
            CancellationToken::new(),
        );
        pool.start(&["http://es-1:9200".to_string()]).await.unwrap();
        BulkBatcher::new(pool, config)
    }

    fn plain(budget: usize) -> BatcherConfig {
        BatcherConfig {
            target_bulk_bytes: budget,
            compression_level: 0,
            ..Default::default()
        }
    }

    fn doc(i: usize, padding: usize) -> Action {
        Action::index(
            ActionParams {
                id: Some(i.to_string()),
                ..Default::default()
            },
            json!({ "n": i, "pad": "x".repeat(padding) }),
        )
    }

    fn header_usize(request: &RecordedRequest, name: &str) -> usize {
        request.header(name).unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn test_empty_actions_send_nothing() {
        let transport = Arc::new(ScriptedTransport::healthy_cluster());
        let batcher = batcher_with(Arc::clone(&transport), plain(1024)).await;

        let response = batcher.bulk(&[]).await.unwrap();
        assert!(!response.errors);
        assert!(response.items.is_empty());
        assert!(transport.requests_to("/_bulk").is_empty());
    }

    #[tokio::test]
    async fn test_sub_requests_respect_budget() {
        let transport = Arc::new(ScriptedTransport::healthy_cluster());
        let budget = 400;
        let batcher = batcher_with(Arc::clone(&transport), plain(budget)).await;

        let actions: Vec<Action> = (0..25).map(|i| doc(i, 40)).collect();
        let response = batcher.bulk(&actions).await.unwrap();
        assert_eq!(response.items.len(), actions.len());

        let requests = transport.requests_to("/_bulk");
        assert!(requests.len() > 1);

        let mut sent = 0;
        for request in &requests {
            let body = request.decoded_body();
            assert!(body.len() <= budget, "{} > {}", body.len(), budget);
            assert_eq!(header_usize(request, UNCOMPRESSED_LENGTH_HEADER), body.len());
            assert_eq!(
                header_usize(request, EVENT_COUNT_HEADER),
                request.bulk_verbs().len()
            );
            assert!(request.header("content-encoding").is_none());
            sent += request.bulk_verbs().len();
        }
        assert_eq!(sent, actions.len());
    }

    #[tokio::test]
    async fn test_oversized_document_is_sent_alone() {
        let transport = Arc::new(ScriptedTransport::healthy_cluster());
        let batcher = batcher_with(Arc::clone(&transport), plain(200)).await;

        let actions = vec![doc(1, 10), doc(2, 1000), doc(3, 10)];
        let response = batcher.bulk(&actions).await.unwrap();
        assert_eq!(response.items.len(), 3);

        let requests = transport.requests_to("/_bulk");
        let counts: Vec<usize> = requests
            .iter()
            .map(|r| header_usize(r, EVENT_COUNT_HEADER))
            .collect();
        assert_eq!(counts, vec![1, 1, 1]);
        assert!(requests[1].decoded_body().len() > 200);
    }

    #[tokio::test]
    async fn test_gzip_sub_requests() {
        let transport = Arc::new(ScriptedTransport::healthy_cluster());
        let config = BatcherConfig {
            target_bulk_bytes: 1024,
            compression_level: 6,
            ..Default::default()
        };
        let batcher = batcher_with(Arc::clone(&transport), config).await;

        let actions: Vec<Action> = (0..40).map(|i| doc(i, 50)).collect();
        let response = batcher.bulk(&actions).await.unwrap();
        assert_eq!(response.items.len(), 40);

        for request in transport.requests_to("/_bulk") {
            assert_eq!(request.header("content-encoding"), Some("gzip"));
            let decoded = request.decoded_body();
            assert!(decoded.len() <= 1024);
            assert_eq!(header_usize(&request, UNCOMPRESSED_LENGTH_HEADER), decoded.len());
            assert!(request.body.as_ref().unwrap().len() < decoded.len());
        }
    }

    #[tokio::test]
    async fn test_payload_too_large_becomes_item_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let transport = Arc::new(ScriptedTransport::new(move |req: &RecordedRequest| {
            if req.route() != "/_bulk" {
                return cluster_response(req);
            }
            // Second sub-request is rejected
            if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                return Err(TransportError::BadResponseCode {
                    status: StatusCode::PAYLOAD_TOO_LARGE,
                    url: req.url.clone(),
                    body: Bytes::new(),
                });
            }
            Ok(bulk_response(&req.bulk_verbs(), 201))
        }));
        let batcher = batcher_with(Arc::clone(&transport), plain(300)).await;

        let actions: Vec<Action> = (0..12).map(|i| doc(i, 40)).collect();
        let response = batcher.bulk(&actions).await.unwrap();

        assert!(response.errors);
        assert_eq!(response.items.len(), actions.len());

        let requests = transport.requests_to("/_bulk");
        let rejected = header_usize(&requests[1], EVENT_COUNT_HEADER);
        let failed: Vec<_> = response.items.iter().filter(|i| i.status() == 413).collect();
        assert_eq!(failed.len(), rejected);
        assert!(failed
            .iter()
            .all(|i| i.error_type() == Some(PAYLOAD_TOO_LARGE_REASON)));
    }

    #[tokio::test]
    async fn test_other_bad_status_propagates() {
        let transport = Arc::new(ScriptedTransport::new(|req: &RecordedRequest| {
            if req.route() == "/_bulk" {
                return Err(TransportError::BadResponseCode {
                    status: StatusCode::TOO_MANY_REQUESTS,
                    url: req.url.clone(),
                    body: Bytes::new(),
                });
            }
            cluster_response(req)
        }));
        let batcher = batcher_with(transport, plain(1024)).await;

        let err = batcher.bulk(&[doc(1, 1)]).await.unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::TOO_MANY_REQUESTS));
    }

    #[tokio::test]
    async fn test_not_found_is_a_bad_status() {
        let transport = Arc::new(ScriptedTransport::new(|req: &RecordedRequest| {
            if req.route() == "/_bulk" {
                let body = r#"{"error":{"type":"index_not_found_exception"},"status":404}"#;
                return Ok(HttpResponse::new(StatusCode::NOT_FOUND, body));
            }
            cluster_response(req)
        }));
        let batcher = batcher_with(transport, plain(1024)).await;

        let err = batcher.bulk(&[doc(1, 1), doc(2, 1)]).await.unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
        assert!(matches!(
            err,
            BulkError::Pool(PoolError::BadResponseCode { ref url, .. }) if url.ends_with("/_bulk")
        ));
    }

    #[tokio::test]
    async fn test_errors_flag_is_ored_across_sub_responses() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let transport = Arc::new(ScriptedTransport::new(move |req: &RecordedRequest| {
            if req.route() != "/_bulk" {
                return cluster_response(req);
            }
            let status = if counter.fetch_add(1, Ordering::SeqCst) == 0 { 201 } else { 429 };
            Ok(bulk_response(&req.bulk_verbs(), status))
        }));
        let batcher = batcher_with(transport, plain(150)).await;

        let response = batcher.bulk(&[doc(1, 40), doc(2, 40)]).await.unwrap();
        assert!(response.errors);
        assert_eq!(response.items[0].status(), 201);
        assert_eq!(response.items[1].status(), 429);
    }

    #[tokio::test]
    async fn test_undecodable_response() {
        let transport = Arc::new(ScriptedTransport::new(|req: &RecordedRequest| {
            if req.route() == "/_bulk" {
                return Ok(HttpResponse::new(StatusCode::OK, "<html>proxy</html>"));
            }
            cluster_response(req)
        }));
        let batcher = batcher_with(transport, plain(1024)).await;
        assert!(matches!(
            batcher.bulk(&[doc(1, 1)]).await,
            Err(BulkError::Decode(_))
        ));
    }
}
