//! Proxy descriptors and the proxy-selection seam.

use std::fmt;

use url::Url;

/// How to reach an origin server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Proxy {
    /// Connect to the origin directly.
    Direct,
    /// Tunnel or forward through an HTTP proxy at `host:port`.
    Http { host: String, port: u16 },
    /// Relay through a SOCKS proxy; the origin hostname stays unresolved.
    Socks { host: String, port: u16 },
}

impl Proxy {
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self::Http {
            host: host.into(),
            port,
        }
    }

    pub fn socks(host: impl Into<String>, port: u16) -> Self {
        Self::Socks {
            host: host.into(),
            port,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct)
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("DIRECT"),
            Self::Http { host, port } => write!(f, "HTTP {host}:{port}"),
            Self::Socks { host, port } => write!(f, "SOCKS {host}:{port}"),
        }
    }
}

/// Chooses the proxies to attempt for a URL, in preference order.
pub trait ProxySelector: Send + Sync {
    fn select(&self, url: &Url) -> Vec<Proxy>;

    /// Feedback hook: connecting through `proxy` failed.
    fn connect_failed(&self, _url: &Url, _proxy: &Proxy) {}
}

/// Selector that never proxies.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProxySelector;

impl ProxySelector for NoProxySelector {
    fn select(&self, _url: &Url) -> Vec<Proxy> {
        vec![Proxy::Direct]
    }
}

/// Selector with a fixed proxy list.
#[derive(Debug, Clone)]
pub struct FixedProxySelector {
    proxies: Vec<Proxy>,
}

impl FixedProxySelector {
    pub fn new(proxies: Vec<Proxy>) -> Self {
        Self { proxies }
    }
}

impl ProxySelector for FixedProxySelector {
    fn select(&self, _url: &Url) -> Vec<Proxy> {
        self.proxies.clone()
    }
}
