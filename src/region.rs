//! Dial targets: fixed relay URLs and directory-provided regions.

use std::str::FromStr;

use http::uri::{Scheme, Uri};
use n0_error::e;

use crate::error::ClientError;

/// Default relay port when the node or URL does not carry one.
pub(crate) const DEFAULT_PORT: u16 = 443;

/// A named cluster of relay nodes, any of which can terminate a relay
/// connection for the region.
#[derive(Debug, Clone)]
pub struct RelayRegion {
    /// Directory-assigned region id.
    pub region_id: u64,
    /// Short human-readable region code, e.g. `"nyc"`.
    pub region_code: String,
    /// Nodes in preference order.
    pub nodes: Vec<RelayNode>,
}

/// One relay node inside a region.
#[derive(Debug, Clone, Default)]
pub struct RelayNode {
    /// DNS name of the node; also the TLS server name.
    pub host_name: String,
    /// Optional IPv4 literal. When set but not a valid IPv4 address, the
    /// IPv4 family is disabled for this node.
    pub ipv4: Option<String>,
    /// Optional IPv6 literal, analogous to `ipv4`.
    pub ipv6: Option<String>,
    /// Relay port; `None` means 443.
    pub port: Option<u16>,
    /// Expected certificate name when it differs from `host_name`.
    pub cert_name: Option<String>,
    /// Disables certificate verification for this node. Tests only.
    pub insecure_for_tests: bool,
    /// Node only serves STUN; never dialed for relay connections.
    pub stun_only: bool,
}

impl RelayNode {
    pub(crate) fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// The URL the upgrade request is issued against for this node.
    pub(crate) fn relay_path(&self) -> &'static str {
        "/derp"
    }
}

/// A parsed fixed-URL dial target.
#[derive(Debug, Clone)]
pub(crate) struct UrlTarget {
    /// The URL as given, for log lines and error annotations.
    pub url: String,
    /// Host name or IP literal.
    pub host: String,
    /// Host and optional port as they appeared in the URL; used verbatim as
    /// the `Host` header.
    pub host_header: String,
    /// Explicit or scheme-derived port.
    pub port: u16,
    /// Path and query for the upgrade request line.
    pub path: String,
    /// False only for the `http` scheme.
    pub use_tls: bool,
}

impl UrlTarget {
    pub(crate) fn parse(url: &str) -> Result<Self, ClientError> {
        let invalid = |scheme: &str| {
            e!(ClientError::InvalidUrlScheme {
                scheme: scheme.to_string(),
            })
        };
        let uri = Uri::from_str(url).map_err(|_| invalid(""))?;
        let scheme = uri.scheme().cloned().ok_or_else(|| invalid(""))?;
        let authority = uri.authority().ok_or_else(|| invalid(scheme.as_str()))?;
        let port = match authority.port_u16() {
            Some(port) => port,
            None if scheme == Scheme::HTTPS => DEFAULT_PORT,
            None if scheme == Scheme::HTTP => 80,
            None => return Err(invalid(scheme.as_str())),
        };
        let path = match uri.path_and_query() {
            Some(pq) if !pq.as_str().is_empty() => pq.as_str().to_string(),
            _ => "/".to_string(),
        };
        Ok(Self {
            url: url.to_string(),
            host: authority.host().to_string(),
            host_header: authority.as_str().to_string(),
            port,
            path,
            use_tls: scheme != Scheme::HTTP,
        })
    }
}
