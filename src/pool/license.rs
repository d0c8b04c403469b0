use async_trait::async_trait;
use hyper::{HeaderMap, Method};
use serde::Deserialize;
use tracing::{error, warn};

use crate::transport::Transport;

/// Extra veto on endpoint aliveness, consulted after a passing probe
#[async_trait]
pub trait LicenseChecker: Send + Sync {
    async fn appropriate(&self, transport: &dyn Transport, url: &str, headers: &HeaderMap) -> bool;
}

/// Accepts every endpoint
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAppropriate;

#[async_trait]
impl LicenseChecker for AlwaysAppropriate {
    async fn appropriate(&self, _: &dyn Transport, _: &str, _: &HeaderMap) -> bool {
        true
    }
}

#[derive(Debug, Deserialize)]
struct LicenseResponse {
    license: Option<License>,
}

#[derive(Debug, Deserialize)]
struct License {
    status: Option<String>,
}

/// Reads `GET /_license`.
///
/// A missing license vetoes the endpoint. An expired or invalid one is
/// only warned about.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClusterLicenseChecker;

impl ClusterLicenseChecker {
    async fn license_status(
        &self,
        transport: &dyn Transport,
        url: &str,
        headers: &HeaderMap,
    ) -> Option<String> {
        let response = match transport
            .perform(url, Method::GET, "/_license", headers, None)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(url = %url, error = %e, "Unable to retrieve license information");
                return None;
            }
        };

        serde_json::from_slice::<LicenseResponse>(&response.body)
            .ok()
            .and_then(|r| r.license)
            .and_then(|l| l.status)
    }
}

#[async_trait]
impl LicenseChecker for ClusterLicenseChecker {
    async fn appropriate(&self, transport: &dyn Transport, url: &str, headers: &HeaderMap) -> bool {
        match self.license_status(transport, url, headers).await.as_deref() {
            Some("active") => true,
            None => {
                warn!(url = %url, "Connecting to a cluster without a license, node will not be used");
                false
            }
            Some(status) => {
                warn!(
                    url = %url,
                    status = %status,
                    "Cluster license is not active, please check its status"
                );
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{HttpResponse, ScriptedTransport};
    use hyper::StatusCode;

    fn license_transport(body: &'static str) -> ScriptedTransport {
        ScriptedTransport::new(move |_| Ok(HttpResponse::new(StatusCode::OK, body)))
    }

    #[tokio::test]
    async fn test_active_license_is_appropriate() {
        let transport = license_transport(r#"{"license":{"status":"active","type":"basic"}}"#);
        let checker = ClusterLicenseChecker;
        assert!(checker.appropriate(&transport, "http://es-1:9200", &HeaderMap::new()).await);
        assert_eq!(transport.requests_to("/_license").len(), 1);
    }

    #[tokio::test]
    async fn test_expired_license_is_tolerated() {
        let transport = license_transport(r#"{"license":{"status":"expired"}}"#);
        assert!(ClusterLicenseChecker
            .appropriate(&transport, "http://es-1:9200", &HeaderMap::new())
            .await);
    }

    #[tokio::test]
    async fn test_missing_license_vetoes() {
        let transport = license_transport("{}");
        assert!(!ClusterLicenseChecker
            .appropriate(&transport, "http://es-1:9200", &HeaderMap::new())
            .await);
    }

    #[tokio::test]
    async fn test_always_appropriate() {
        let transport = license_transport("{}");
        assert!(AlwaysAppropriate
            .appropriate(&transport, "http://es-1:9200", &HeaderMap::new())
            .await);
        assert!(transport.requests().is_empty());
    }
}
