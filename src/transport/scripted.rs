//! In-memory transport
//!
//! Answers requests from a closure and records everything it sees. Used
//! for `--dry-run` and by the test suites.

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use hyper::header::CONTENT_ENCODING;
use hyper::{HeaderMap, Method, StatusCode};
use serde_json::{json, Value};
use std::io::Read;
use std::sync::{Mutex, PoisonError};

use super::client::{HttpResponse, Transport, TransportError};

/// A request as seen by [`ScriptedTransport`]
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl RecordedRequest {
    /// Path without the query string
    pub fn route(&self) -> &str {
        self.path.split('?').next().unwrap_or(&self.path)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Body bytes, gunzipped when `Content-Encoding: gzip` is set
    pub fn decoded_body(&self) -> Vec<u8> {
        let Some(body) = &self.body else {
            return Vec::new();
        };
        if self.header(CONTENT_ENCODING.as_str()) == Some("gzip") {
            let mut out = Vec::new();
            if GzDecoder::new(&body[..]).read_to_end(&mut out).is_ok() {
                return out;
            }
        }
        body.to_vec()
    }

    /// Verbs of the bulk actions carried in the body, in order
    pub fn bulk_verbs(&self) -> Vec<String> {
        let body = self.decoded_body();
        let mut verbs = Vec::new();
        let mut lines = body
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty());

        while let Some(line) = lines.next() {
            let Ok(Value::Object(header)) = serde_json::from_slice::<Value>(line) else {
                continue;
            };
            let Some(verb) = header.keys().next().cloned() else {
                continue;
            };
            if verb != "delete" {
                lines.next();
            }
            verbs.push(verb);
        }
        verbs
    }
}

type Handler = dyn Fn(&RecordedRequest) -> Result<HttpResponse, TransportError> + Send + Sync;

/// Transport answering from a closure
pub struct ScriptedTransport {
    handler: Box<Handler>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedTransport {
    pub fn new(
        handler: impl Fn(&RecordedRequest) -> Result<HttpResponse, TransportError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A modern, licensed node that accepts every bulk item
    pub fn healthy_cluster() -> Self {
        Self::new(cluster_response)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Recorded requests whose route equals `route`
    pub fn requests_to(&self, route: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.route() == route)
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn perform(
        &self,
        base_url: &str,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        body: Option<Bytes>,
    ) -> Result<HttpResponse, TransportError> {
        let request = RecordedRequest {
            url: base_url.to_string(),
            method,
            path: path.to_string(),
            headers: headers.clone(),
            body,
        };
        let result = (self.handler)(&request);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        result
    }
}

/// Root document of a node at `version` with the product header set
pub fn root_response(version: &str) -> HttpResponse {
    let body = json!({
        "name": "node-1",
        "cluster_name": "bulkship",
        "version": { "number": version, "build_flavor": "default" },
        "tagline": "You Know, for Search"
    });
    HttpResponse::new(StatusCode::OK, body.to_string())
        .with_header("x-elastic-product", "Elasticsearch")
}

/// Bulk response with one item per action, every item at `status`
pub fn bulk_response(verbs: &[String], status: u16) -> HttpResponse {
    let items: Vec<Value> = verbs
        .iter()
        .map(|verb| {
            let mut result = json!({ "status": status });
            if !(200..300).contains(&status) {
                result["error"] = json!({ "type": "scripted_error", "reason": "scripted" });
            }
            single_item(verb, result)
        })
        .collect();
    let errors = !(200..300).contains(&status);
    HttpResponse::new(
        StatusCode::OK,
        json!({ "errors": errors, "items": items }).to_string(),
    )
}

/// Bulk response with one item per action and per-item statuses
pub fn bulk_response_with_statuses(verbs: &[String], statuses: &[u16]) -> HttpResponse {
    let items: Vec<Value> = verbs
        .iter()
        .zip(statuses)
        .map(|(verb, status)| {
            let mut result = json!({ "status": status });
            if !(200..300).contains(status) {
                result["error"] = json!({ "type": "scripted_error", "reason": "scripted" });
            }
            single_item(verb, result)
        })
        .collect();
    let errors = statuses.iter().any(|s| !(200..300).contains(s));
    HttpResponse::new(
        StatusCode::OK,
        json!({ "errors": errors, "items": items }).to_string(),
    )
}

fn single_item(verb: &str, result: Value) -> Value {
    let mut item = serde_json::Map::new();
    item.insert(verb.to_string(), result);
    Value::Object(item)
}

/// Handler of [`ScriptedTransport::healthy_cluster`]
pub fn cluster_response(request: &RecordedRequest) -> Result<HttpResponse, TransportError> {
    if request.method == Method::HEAD {
        return Ok(HttpResponse::new(StatusCode::OK, Bytes::new()));
    }
    match request.route() {
        "/" => Ok(root_response("8.15.0")),
        "/_license" => Ok(HttpResponse::new(
            StatusCode::OK,
            r#"{"license":{"status":"active"}}"#,
        )),
        "/_bulk" => Ok(bulk_response(&request.bulk_verbs(), 201)),
        _ => Ok(HttpResponse::new(StatusCode::NOT_FOUND, "{}")),
    }
}
