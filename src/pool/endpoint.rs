use chrono::{DateTime, Utc};
use std::fmt;
use url::Url;

use super::connection::PoolError;

/// Default port of a cluster node when the configured URL has none
pub const DEFAULT_PORT: u16 = 9200;

/// Lifecycle of an endpoint.
///
/// `Unknown -> Alive` and `Dead -> Alive` on a passing health check,
/// `Alive -> Dead` when a request finds the node unreachable. A failing
/// health check only records the error; the state is left as it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Unknown,
    Alive,
    Dead,
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointState::Unknown => "unknown",
            EndpointState::Alive => "alive",
            EndpointState::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// Deployment flavor reported by a node's root endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildFlavor {
    Default,
    Oss,
    Serverless,
    Other(String),
}

impl BuildFlavor {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "default" => BuildFlavor::Default,
            "oss" => BuildFlavor::Oss,
            "serverless" => BuildFlavor::Serverless,
            other => BuildFlavor::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            BuildFlavor::Default => "default",
            BuildFlavor::Oss => "oss",
            BuildFlavor::Serverless => "serverless",
            BuildFlavor::Other(other) => other,
        }
    }
}

/// Liveness metadata for one cluster node.
///
/// Plain data: every read and write happens under the pool lock.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Normalized URL (`scheme://host:port`), also the pool key
    pub url: String,

    /// Requests currently running against this endpoint
    pub in_use: u32,

    pub state: EndpointState,

    pub last_error: Option<String>,

    pub last_errored_at: Option<DateTime<Utc>>,

    /// Last observed `version.number`
    pub version: Option<String>,

    pub build_flavor: Option<BuildFlavor>,
}

impl Endpoint {
    pub fn new(url: String) -> Self {
        Self {
            url,
            in_use: 0,
            state: EndpointState::Unknown,
            last_error: None,
            last_errored_at: None,
            version: None,
            build_flavor: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state == EndpointState::Alive
    }

    /// Record a failure and move to `Dead`
    pub fn mark_dead(&mut self, error: impl Into<String>) {
        self.state = EndpointState::Dead;
        self.last_error = Some(error.into());
        self.last_errored_at = Some(Utc::now());
    }
}

/// Normalize a node address into the pool key.
///
/// Accepts `host`, `host:port` or a full URL. Credentials, path and query
/// are dropped, the port defaults to 9200 and the scheme to `default_scheme`.
pub fn normalize_url(raw: &str, default_scheme: &str) -> Result<String, PoolError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(PoolError::InvalidUrl("empty address".to_string()));
    }

    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("{}://{}", default_scheme, raw)
    };

    let url = Url::parse(&with_scheme)
        .map_err(|e| PoolError::InvalidUrl(format!("{}: {}", raw, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| PoolError::InvalidUrl(format!("{}: missing host", raw)))?;
    // `Url` hides ports equal to the scheme default, so look at the raw text
    let port = match url.port() {
        Some(port) => port,
        None if has_explicit_port(&with_scheme) => {
            url.port_or_known_default().unwrap_or(DEFAULT_PORT)
        }
        None => DEFAULT_PORT,
    };

    Ok(format!("{}://{}:{}", url.scheme(), host, port))
}

fn has_explicit_port(url: &str) -> bool {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let host_port = authority
        .rsplit_once('@')
        .map(|(_, host_port)| host_port)
        .unwrap_or(authority);

    match host_port.rsplit_once(':') {
        Some((_, port)) => !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// Scheme of a normalized or raw URL, `http` when absent
pub fn scheme_of(raw: &str) -> &str {
    raw.split_once("://").map(|(scheme, _)| scheme).unwrap_or("http")
}
