//! Endpoint probing and capability detection
//!
//! A probe is a cheap `HEAD` on the health-check path followed by a `GET /`.
//! The root document decides whether the node is a compatible document
//! store; the rule depends on the version bracket, see [`COMPATIBILITY_POLICY`].

use hyper::header::HeaderName;
use hyper::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use std::cmp::Ordering;
use std::fmt;
use tracing::debug;

use super::connection::PoolError;
use super::endpoint::BuildFlavor;
use crate::transport::{HttpResponse, Transport, TransportError};

/// Header required on every request once a serverless deployment is seen
pub const API_VERSION_HEADER: &str = "elastic-api-version";
pub const API_VERSION: &str = "2023-10-31";

const PRODUCT_HEADER: &str = "x-elastic-product";
const PRODUCT_NAME: &str = "Elasticsearch";
const TAGLINE: &str = "You Know, for Search";

/// `major.minor.patch`, pre-release suffixes ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let core = raw.trim().split(['-', '+']).next()?;
        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().map(str::parse).transpose().ok()?.unwrap_or(0);
        let patch = parts.next().map(str::parse).transpose().ok()?.unwrap_or(0);
        Some(Self::new(major, minor, patch))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// What a root response must carry to count as a compatible node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    Incompatible,
    /// Tagline must match
    Tagline,
    /// Tagline must match and `build_flavor` must be `default`
    TaglineAndDefaultFlavor,
    /// `X-Elastic-Product: Elasticsearch` response header
    ProductHeader,
}

/// Half-open version range `[min, max)` with its acceptance rule
#[derive(Debug, Clone, Copy)]
pub struct VersionBracket {
    pub min: Version,
    pub max: Option<Version>,
    pub acceptance: Acceptance,
}

impl VersionBracket {
    fn contains(&self, version: &Version) -> bool {
        *version >= self.min
            && self
                .max
                .map_or(true, |max| version.cmp(&max) == Ordering::Less)
    }
}

/// Bracket boundaries follow the product's compatibility history and must
/// not be merged.
pub const COMPATIBILITY_POLICY: &[VersionBracket] = &[
    VersionBracket {
        min: Version::new(0, 0, 0),
        max: Some(Version::new(6, 0, 0)),
        acceptance: Acceptance::Incompatible,
    },
    VersionBracket {
        min: Version::new(6, 0, 0),
        max: Some(Version::new(7, 0, 0)),
        acceptance: Acceptance::Tagline,
    },
    VersionBracket {
        min: Version::new(7, 0, 0),
        max: Some(Version::new(7, 14, 0)),
        acceptance: Acceptance::TaglineAndDefaultFlavor,
    },
    VersionBracket {
        min: Version::new(7, 14, 0),
        max: None,
        acceptance: Acceptance::ProductHeader,
    },
];

pub fn acceptance_for(version: &Version) -> Acceptance {
    COMPATIBILITY_POLICY
        .iter()
        .find(|bracket| bracket.contains(version))
        .map(|bracket| bracket.acceptance)
        .unwrap_or(Acceptance::Incompatible)
}

/// Subset of the root (`GET /`) document
#[derive(Debug, Clone, Deserialize)]
pub struct RootInfo {
    pub version: Option<RootVersion>,
    pub tagline: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RootVersion {
    pub number: String,
    pub build_flavor: Option<String>,
}

impl RootInfo {
    pub fn parse(body: &[u8]) -> Option<Self> {
        serde_json::from_slice(body).ok()
    }

    pub fn version(&self) -> Option<Version> {
        self.version.as_ref().and_then(|v| Version::parse(&v.number))
    }

    pub fn build_flavor(&self) -> Option<BuildFlavor> {
        self.version
            .as_ref()
            .and_then(|v| v.build_flavor.as_deref())
            .map(BuildFlavor::parse)
    }

    fn has_tagline(&self) -> bool {
        self.tagline.as_deref() == Some(TAGLINE)
    }
}

/// Whether a root response comes from a compatible document store
pub fn is_compatible(response: &HttpResponse, info: &RootInfo) -> bool {
    if response.status == StatusCode::UNAUTHORIZED || response.status == StatusCode::FORBIDDEN {
        return false;
    }
    let Some(version) = info.version() else {
        return false;
    };

    match acceptance_for(&version) {
        Acceptance::Incompatible => false,
        Acceptance::Tagline => info.has_tagline(),
        Acceptance::TaglineAndDefaultFlavor => {
            info.has_tagline() && info.build_flavor() == Some(BuildFlavor::Default)
        }
        Acceptance::ProductHeader => response.header(PRODUCT_HEADER) == Some(PRODUCT_NAME),
    }
}

/// Result of probing one endpoint
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub version: Version,
    pub raw_version: String,
    pub build_flavor: Option<BuildFlavor>,
    pub compatible: bool,
}

/// Settings shared by every probe
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub healthcheck_path: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            healthcheck_path: "/".to_string(),
        }
    }
}

pub fn api_version_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static(API_VERSION_HEADER),
        hyper::header::HeaderValue::from_static(API_VERSION),
    );
    headers
}

/// Probe a node outside the pool lock.
///
/// During registration, credential, privilege and API-version problems
/// are returned as [`PoolError::Configuration`]; later they are ordinary
/// errors that leave the node dead.
pub async fn probe_endpoint(
    transport: &dyn Transport,
    url: &str,
    config: &ProbeConfig,
    headers: &HeaderMap,
    register_phase: bool,
) -> Result<ProbeOutcome, PoolError> {
    debug!(url = %url, path = %config.healthcheck_path, "Running health check");

    transport
        .perform(url, Method::HEAD, &config.healthcheck_path, headers, None)
        .await
        .map_err(|e| registration_error(e, register_phase))?;

    let root = transport
        .perform(url, Method::GET, "/", headers, None)
        .await
        .map_err(|e| registration_error(e, register_phase))?;

    let info = RootInfo::parse(&root.body)
        .ok_or_else(|| PoolError::InvalidResponse(format!("{}: unparsable root document", url)))?;
    let version = info
        .version()
        .ok_or_else(|| PoolError::InvalidResponse(format!("{}: root document has no version", url)))?;
    let raw_version = info
        .version
        .as_ref()
        .map(|v| v.number.clone())
        .unwrap_or_default();
    let build_flavor = info.build_flavor();

    if build_flavor == Some(BuildFlavor::Serverless) {
        // Serverless requires a supported API version on every request
        let mut versioned = headers.clone();
        versioned.extend(api_version_headers());
        transport
            .perform(url, Method::GET, "/", &versioned, None)
            .await
            .map_err(|e| registration_error(e, register_phase))?;
    }

    let compatible = is_compatible(&root, &info);
    if !compatible && register_phase {
        return Err(PoolError::Configuration(format!(
            "Could not connect to a compatible version of the cluster at {} (version {})",
            url, raw_version
        )));
    }

    Ok(ProbeOutcome {
        version,
        raw_version,
        build_flavor,
        compatible,
    })
}

fn registration_error(error: TransportError, register_phase: bool) -> PoolError {
    if register_phase {
        match error.status() {
            Some(StatusCode::UNAUTHORIZED) | Some(StatusCode::FORBIDDEN) => {
                return PoolError::Configuration(
                    "Could not read the cluster. Please check the credentials, or privileges."
                        .to_string(),
                );
            }
            Some(StatusCode::BAD_REQUEST) => {
                return PoolError::Configuration(format!(
                    "The {} header is not valid for this deployment",
                    API_VERSION_HEADER
                ));
            }
            _ => {}
        }
    }
    PoolError::from(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn root(number: &str, flavor: Option<&str>, tagline: Option<&str>) -> (HttpResponse, RootInfo) {
        let mut version = json!({ "number": number });
        if let Some(flavor) = flavor {
            version["build_flavor"] = json!(flavor);
        }
        let mut doc = json!({ "version": version });
        if let Some(tagline) = tagline {
            doc["tagline"] = json!(tagline);
        }
        let body = serde_json::to_vec(&doc).unwrap();
        let info = RootInfo::parse(&body).unwrap();
        (HttpResponse::new(StatusCode::OK, body), info)
    }

    #[test]
    fn test_version_parse() {
        assert_eq!(Version::parse("8.11.1"), Some(Version::new(8, 11, 1)));
        assert_eq!(Version::parse("7.14.0-SNAPSHOT"), Some(Version::new(7, 14, 0)));
        assert_eq!(Version::parse("9"), Some(Version::new(9, 0, 0)));
        assert_eq!(Version::parse("x.y"), None);
    }

    #[test]
    fn test_bracket_boundaries() {
        assert_eq!(acceptance_for(&Version::new(5, 6, 16)), Acceptance::Incompatible);
        assert_eq!(acceptance_for(&Version::new(6, 0, 0)), Acceptance::Tagline);
        assert_eq!(acceptance_for(&Version::new(6, 8, 23)), Acceptance::Tagline);
        assert_eq!(
            acceptance_for(&Version::new(7, 0, 0)),
            Acceptance::TaglineAndDefaultFlavor
        );
        assert_eq!(
            acceptance_for(&Version::new(7, 13, 4)),
            Acceptance::TaglineAndDefaultFlavor
        );
        assert_eq!(acceptance_for(&Version::new(7, 14, 0)), Acceptance::ProductHeader);
        assert_eq!(acceptance_for(&Version::new(8, 15, 0)), Acceptance::ProductHeader);
    }

    #[test]
    fn test_six_x_requires_tagline() {
        let (response, info) = root("6.8.0", None, Some(TAGLINE));
        assert!(is_compatible(&response, &info));

        let (response, info) = root("6.8.0", None, Some("You Know, for Something Else"));
        assert!(!is_compatible(&response, &info));
    }

    #[test]
    fn test_seven_early_requires_default_flavor() {
        let (response, info) = root("7.10.2", Some("default"), Some(TAGLINE));
        assert!(is_compatible(&response, &info));

        let (response, info) = root("7.10.2", Some("oss"), Some(TAGLINE));
        assert!(!is_compatible(&response, &info));

        let (response, info) = root("7.10.2", None, Some(TAGLINE));
        assert!(!is_compatible(&response, &info));
    }

    #[test]
    fn test_modern_requires_product_header() {
        let (response, info) = root("8.12.0", Some("default"), Some(TAGLINE));
        assert!(!is_compatible(&response, &info));

        let response = response.with_header("x-elastic-product", "Elasticsearch");
        assert!(is_compatible(&response, &info));
    }

    #[test]
    fn test_old_and_forbidden_are_incompatible() {
        let (response, info) = root("5.6.0", None, Some(TAGLINE));
        assert!(!is_compatible(&response, &info));

        let (mut response, info) = root("8.12.0", None, None);
        response = response.with_header("x-elastic-product", "Elasticsearch");
        response.status = StatusCode::FORBIDDEN;
        assert!(!is_compatible(&response, &info));
    }
}
