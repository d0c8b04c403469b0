//! Topology discovery
//!
//! Parses the nodes listing (`GET /_nodes/http`) into endpoint URLs.

use serde::Deserialize;
use std::collections::HashMap;

use super::connection::PoolError;
use super::endpoint::normalize_url;

#[derive(Debug, Deserialize)]
struct NodesResponse {
    #[serde(default)]
    nodes: HashMap<String, NodeInfo>,
}

#[derive(Debug, Deserialize)]
struct NodeInfo {
    roles: Option<Vec<String>>,
    http: Option<NodeHttp>,
}

#[derive(Debug, Deserialize)]
struct NodeHttp {
    publish_address: Option<String>,
}

impl NodeInfo {
    fn is_master_only(&self) -> bool {
        matches!(self.roles.as_deref(), Some([role]) if role == "master")
    }
}

/// Turn a `publish_address` into `host:port`.
///
/// Handles both `host:port` and `hostname/ip:port`; the hostname wins when
/// present.
pub fn parse_publish_address(address: &str) -> Option<String> {
    let (host_part, port) = address.rsplit_once(':')?;
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let host = match host_part.split_once('/') {
        Some((hostname, _)) if !hostname.is_empty() => hostname,
        Some((_, ip)) => ip,
        None => host_part,
    };
    if host.is_empty() {
        return None;
    }

    Some(format!("{}:{}", host, port))
}

/// Extract endpoint URLs from a nodes listing, skipping master-only nodes
pub fn parse_nodes(body: &[u8], scheme: &str) -> Result<Vec<String>, PoolError> {
    let response: NodesResponse = serde_json::from_slice(body)
        .map_err(|e| PoolError::InvalidResponse(format!("unparsable nodes listing: {}", e)))?;

    let mut urls: Vec<String> = response
        .nodes
        .values()
        .filter(|node| !node.is_master_only())
        .filter_map(|node| node.http.as_ref()?.publish_address.as_deref())
        .filter_map(parse_publish_address)
        .filter_map(|address| normalize_url(&address, scheme).ok())
        .collect();

    urls.sort();
    urls.dedup();
    Ok(urls)
}
