//! Shared helpers for the integration tests: a controllable in-memory
//! cluster built on `ScriptedTransport`.

#![allow(dead_code)]

use bulkship::bulk::{Action, ActionParams};
use bulkship::config::Config;
use bulkship::transport::scripted::{bulk_response_with_statuses, cluster_response, RecordedRequest};
use bulkship::transport::{HttpResponse, ScriptedTransport, TransportError};
use hyper::StatusCode;
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// Nodes that can be taken down, scripted bulk statuses and a nodes listing
#[derive(Default)]
pub struct FakeCluster {
    down: Mutex<HashSet<String>>,
    bulk_statuses: Mutex<VecDeque<Vec<u16>>>,
    nodes: Mutex<Option<Value>>,
    crash_next_bulk_target: Mutex<bool>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_down(&self, url: &str, down: bool) {
        let mut nodes = self.down.lock().unwrap();
        if down {
            nodes.insert(url.to_string());
        } else {
            nodes.remove(url);
        }
    }

    /// Per-item statuses for the next bulk call; later calls succeed
    pub fn push_bulk_statuses(&self, statuses: Vec<u16>) {
        self.bulk_statuses.lock().unwrap().push_back(statuses);
    }

    /// The node that receives the next bulk request goes down before answering
    pub fn crash_next_bulk_target(&self) {
        *self.crash_next_bulk_target.lock().unwrap() = true;
    }

    pub fn set_nodes(&self, listing: Value) {
        *self.nodes.lock().unwrap() = Some(listing);
    }

    pub fn transport(self: &Arc<Self>) -> Arc<ScriptedTransport> {
        let cluster = Arc::clone(self);
        Arc::new(ScriptedTransport::new(move |req: &RecordedRequest| {
            cluster.respond(req)
        }))
    }

    fn respond(&self, req: &RecordedRequest) -> Result<HttpResponse, TransportError> {
        if req.route() == "/_bulk"
            && std::mem::take(&mut *self.crash_next_bulk_target.lock().unwrap())
        {
            self.set_down(&req.url, true);
        }
        if self.down.lock().unwrap().contains(&req.url) {
            return Err(TransportError::Unreachable {
                url: req.url.clone(),
                message: "connection refused".to_string(),
            });
        }

        match req.route() {
            "/_bulk" => {
                let verbs = req.bulk_verbs();
                let statuses = self
                    .bulk_statuses
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| vec![201; verbs.len()]);
                Ok(bulk_response_with_statuses(&verbs, &statuses))
            }
            "/_nodes/http" => match self.nodes.lock().unwrap().as_ref() {
                Some(listing) => Ok(HttpResponse::new(StatusCode::OK, listing.to_string())),
                None => Ok(HttpResponse::new(StatusCode::OK, r#"{"nodes":{}}"#)),
            },
            _ => cluster_response(req),
        }
    }
}

/// Config for `hosts` with short retry intervals
pub fn config(hosts: &[&str]) -> Config {
    let mut config = Config::default();
    config.cluster.hosts = hosts.iter().map(|h| h.to_string()).collect();
    config.retry.retry_initial_interval_secs = 1;
    config.retry.retry_max_interval_secs = 4;
    config
}

pub fn docs(n: usize) -> Vec<Action> {
    (0..n)
        .map(|i| {
            Action::index(
                ActionParams {
                    id: Some(format!("doc-{}", i)),
                    index: Some("logs".to_string()),
                    ..Default::default()
                },
                json!({ "message": format!("event {}", i), "seq": i }),
            )
        })
        .collect()
}

/// Bulk requests seen by `transport`, grouped by target URL
pub fn bulk_targets(transport: &ScriptedTransport) -> Vec<String> {
    transport
        .requests_to("/_bulk")
        .into_iter()
        .map(|r| r.url)
        .collect()
}
