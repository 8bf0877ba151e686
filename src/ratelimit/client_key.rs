//! Client key generation and handling.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Key used when no usable origin is available.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Opaque identity of the principal being throttled.
///
/// Every counter in the store is partitioned by this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientKey(String);

impl ClientKey {
    /// Wrap an already derived key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The sentinel key for requests with no usable origin.
    pub fn unknown() -> Self {
        Self(UNKNOWN_CLIENT.to_string())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A subject identifier already verified by an upstream authentication stage.
///
/// Authentication layers insert this into the request extensions; it is the
/// only thing this crate accepts from them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VerifiedSubject(pub String);

/// Transport-level facts about where a request came from.
#[derive(Debug, Clone, Default)]
pub struct RequestOrigin {
    /// Peer address of the connection, as reported by the transport.
    pub remote_addr: Option<String>,
    /// Client address claimed by a fronting proxy (`X-Forwarded-For` / `X-Real-IP`).
    pub forwarded_for: Option<String>,
    /// Verified subject, if authentication already ran.
    pub subject: Option<VerifiedSubject>,
}

impl RequestOrigin {
    /// Origin from a peer address only.
    pub fn from_addr(addr: impl Into<String>) -> Self {
        Self {
            remote_addr: Some(addr.into()),
            ..Default::default()
        }
    }

    /// Extract the origin of an HTTP request.
    ///
    /// Reads the peer address from axum's `ConnectInfo`, proxy headers, and a
    /// [`VerifiedSubject`] extension.
    pub fn from_request<B>(request: &http::Request<B>) -> Self {
        let remote_addr = request
            .extensions()
            .get::<axum::extract::ConnectInfo<SocketAddr>>()
            .map(|info| info.0.to_string());

        let headers = request.headers();
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        let forwarded_for = header("x-forwarded-for")
            .or_else(|| header("x-real-ip"))
            .map(str::to_string);

        let subject = request.extensions().get::<VerifiedSubject>().cloned();

        Self {
            remote_addr,
            forwarded_for,
            subject,
        }
    }
}

/// Derives a [`ClientKey`] from a [`RequestOrigin`].
///
/// Preference order: verified subject, then the proxy-reported address (only
/// when proxies are trusted), then the peer address. Never fails.
#[derive(Debug, Clone, Default)]
pub struct ClientKeyResolver {
    trust_forwarded_headers: bool,
}

impl ClientKeyResolver {
    /// Create a resolver.
    pub fn new(trust_forwarded_headers: bool) -> Self {
        Self {
            trust_forwarded_headers,
        }
    }

    /// Resolve the key for a request origin.
    pub fn resolve(&self, origin: &RequestOrigin) -> ClientKey {
        if let Some(VerifiedSubject(subject)) = &origin.subject {
            let subject = subject.trim();
            if !subject.is_empty() {
                return ClientKey::new(format!("user:{}", subject));
            }
        }

        if self.trust_forwarded_headers {
            if let Some(ip) = origin.forwarded_for.as_deref().and_then(parse_ip) {
                return ClientKey::new(ip.to_string());
            }
        }

        origin
            .remote_addr
            .as_deref()
            .and_then(parse_ip)
            .map(|ip| ClientKey::new(ip.to_string()))
            .unwrap_or_else(ClientKey::unknown)
    }
}

/// Accepts `ip`, `ip:port` and `[v6]:port`.
fn parse_ip(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    raw.parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}
