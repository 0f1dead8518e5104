//! Client identity used to partition per-client limiter state.
//!
//! A key is derived once per request:
//! 1. the first address in `X-Forwarded-For`, when the [`ForwardedPolicy`] trusts it;
//! 2. otherwise the transport peer address (the [`PeerAddr`] request extension);
//! 3. otherwise the sentinel [`UNKNOWN_CLIENT`].
//!
//! `X-Forwarded-For` is client-controlled. Under [`ForwardedPolicy::TrustAll`] a caller can name
//! any key it likes and receive a fresh bucket per request. Deployments that are not behind a
//! known proxy should use [`ForwardedPolicy::Ignore`] or [`ForwardedPolicy::TrustedProxies`].

use http::{HeaderMap, Request};
use ipnet::IpNet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Key shared by every request whose origin could not be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Identity of a client for per-client accounting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientKey(Arc<str>);

impl ClientKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// The sentinel key for requests with no usable origin.
    pub fn unknown() -> Self {
        Self::new(UNKNOWN_CLIENT)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unknown(&self) -> bool {
        &*self.0 == UNKNOWN_CLIENT
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ClientKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

impl From<IpAddr> for ClientKey {
    fn from(ip: IpAddr) -> Self {
        Self::from(ip.to_string())
    }
}

/// Transport peer address, inserted into request extensions by the hosting server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// How much to believe `X-Forwarded-For`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ForwardedPolicy {
    /// Always honour the header when present. Spoofable.
    #[default]
    TrustAll,
    /// Never look at the header.
    Ignore,
    /// Honour the header only when the peer is inside one of these networks.
    TrustedProxies(Vec<IpNet>),
}

/// Derives a [`ClientKey`] from request metadata.
#[derive(Debug, Clone, Default)]
pub struct KeyExtractor {
    policy: ForwardedPolicy,
}

impl KeyExtractor {
    pub fn new(policy: ForwardedPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ForwardedPolicy {
        &self.policy
    }

    /// Key for `req`. Reads only `X-Forwarded-For` and the peer address extension.
    ///
    /// The peer is taken from a [`PeerAddr`] extension, falling back to a bare `SocketAddr`
    /// extension.
    pub fn extract<B>(&self, req: &Request<B>) -> ClientKey {
        let extensions = req.extensions();
        let peer = extensions
            .get::<PeerAddr>()
            .map(|p| p.0.ip())
            .or_else(|| extensions.get::<SocketAddr>().map(SocketAddr::ip));
        self.derive(req.headers(), peer)
    }

    /// Key from raw parts.
    pub fn derive(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> ClientKey {
        if self.honours_forwarded(peer) {
            if let Some(forwarded) = first_forwarded(headers) {
                return ClientKey::new(forwarded);
            }
        }
        peer.map(ClientKey::from).unwrap_or_else(ClientKey::unknown)
    }

    fn honours_forwarded(&self, peer: Option<IpAddr>) -> bool {
        match &self.policy {
            ForwardedPolicy::TrustAll => true,
            ForwardedPolicy::Ignore => false,
            ForwardedPolicy::TrustedProxies(networks) => {
                peer.is_some_and(|ip| networks.iter().any(|net| net.contains(&ip)))
            }
        }
    }
}

fn first_forwarded(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(X_FORWARDED_FOR)?
        .to_str()
        .ok()?
        .split(',')
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
