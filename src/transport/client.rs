//! HTTP transport built on hyper
//!
//! - HTTP/1.1 keep-alive pool from hyper-util
//! - native-tls (OpenSSL) for TLS, optionally without certificate checks
//! - Per-request timeout
//! - Default auth headers (basic or API key)

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::{HeaderMap, Method, Request, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use native_tls::TlsConnector;
use std::time::Duration;
use thiserror::Error;
use tracing::{trace, warn};

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// The host could not be reached (connect failure, reset, timeout)
    #[error("host unreachable: {url}: {message}")]
    Unreachable { url: String, message: String },

    /// The host answered with a status outside 2xx (404 excepted)
    #[error("bad response code {status} from {url}")]
    BadResponseCode {
        status: StatusCode,
        url: String,
        body: Bytes,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    /// Status code of a bad response, if this is one
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            TransportError::BadResponseCode { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// A fully buffered HTTP response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers
            .insert(HeaderName::from_static(name), HeaderValue::from_static(value));
        self
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// One physical HTTP call against a single node
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform `method path` against `base_url` (`scheme://host:port`).
    ///
    /// Statuses outside 2xx, except 404, are returned as
    /// [`TransportError::BadResponseCode`].
    async fn perform(
        &self,
        base_url: &str,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        body: Option<Bytes>,
    ) -> Result<HttpResponse, TransportError>;

    /// Release any resources held by the adapter
    async fn close(&self) {}
}

/// Settings for [`HyperTransport`]
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub request_timeout: Duration,
    pub ssl_verification: bool,
    pub user: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            ssl_verification: true,
            user: None,
            password: None,
            api_key: None,
        }
    }
}

/// Production transport. Clone is cheap, the hyper client is shared.
#[derive(Clone)]
pub struct HyperTransport {
    client: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    default_headers: HeaderMap,
    timeout: Duration,
}

impl HyperTransport {
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(10)));
        http.set_keepalive(Some(Duration::from_secs(90)));

        let tls = if config.ssl_verification {
            TlsConnector::new()
        } else {
            warn!("SSL certificate verification is disabled");
            TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
        }
        .map_err(|e| TransportError::InvalidRequest(format!("TLS setup failed: {}", e)))?;

        let https = HttpsConnector::from((http, tls.into()));

        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .retry_canceled_requests(true)
            .set_host(true)
            .build(https);

        Ok(Self {
            client,
            default_headers: Self::default_headers(config)?,
            timeout: config.request_timeout,
        })
    }

    fn default_headers(config: &TransportConfig) -> Result<HeaderMap, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth = match (&config.api_key, &config.user) {
            (Some(key), _) => Some(format!("ApiKey {}", key)),
            (None, Some(user)) => {
                let password = config.password.as_deref().unwrap_or_default();
                let token = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", user, password));
                Some(format!("Basic {}", token))
            }
            (None, None) => None,
        };

        if let Some(auth) = auth {
            let mut value = HeaderValue::from_str(&auth)
                .map_err(|e| TransportError::InvalidRequest(format!("bad auth header: {}", e)))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        Ok(headers)
    }
}

/// Join a normalized base URL and a request path
pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn perform(
        &self,
        base_url: &str,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        body: Option<Bytes>,
    ) -> Result<HttpResponse, TransportError> {
        let url = join_url(base_url, path);

        let mut builder = Request::builder().method(method.clone()).uri(&url);
        for (name, value) in self.default_headers.iter().chain(headers.iter()) {
            builder = builder.header(name, value);
        }
        let request = builder
            .body(Full::new(body.unwrap_or_default()))
            .map_err(|e| TransportError::InvalidRequest(format!("request build error: {}", e)))?;

        trace!(method = %method, url = %url, "performing request");

        let response = match tokio::time::timeout(self.timeout, self.client.request(request)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(TransportError::Unreachable {
                    url,
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(TransportError::Unreachable {
                    url,
                    message: format!("request timed out after {:?}", self.timeout),
                })
            }
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .collect()
            .await
            .map_err(|e| TransportError::Unreachable {
                url: url.clone(),
                message: format!("body error: {}", e),
            })?
            .to_bytes();

        if !status.is_success() && status != StatusCode::NOT_FOUND {
            return Err(TransportError::BadResponseCode { status, url, body });
        }

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url("http://es-1:9200", "/_bulk"),
            "http://es-1:9200/_bulk"
        );
        assert_eq!(
            join_url("http://es-1:9200/", "_license"),
            "http://es-1:9200/_license"
        );
    }

    #[test]
    fn test_basic_auth_header() {
        let config = TransportConfig {
            user: Some("elastic".to_string()),
            password: Some("changeme".to_string()),
            ..Default::default()
        };
        let headers = HyperTransport::default_headers(&config).unwrap();
        assert_eq!(
            headers.get(AUTHORIZATION).unwrap(),
            "Basic ZWxhc3RpYzpjaGFuZ2VtZQ=="
        );
    }

    #[test]
    fn test_api_key_wins_over_basic() {
        let config = TransportConfig {
            user: Some("elastic".to_string()),
            api_key: Some("abc".to_string()),
            ..Default::default()
        };
        let headers = HyperTransport::default_headers(&config).unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "ApiKey abc");
    }

    #[test]
    fn test_response_header_lookup_is_case_insensitive() {
        let response = HttpResponse::new(StatusCode::OK, "{}")
            .with_header("x-elastic-product", "Elasticsearch");
        assert_eq!(response.header("X-Elastic-Product"), Some("Elasticsearch"));
    }
}
