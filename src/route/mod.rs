//! Route model: concrete (proxy, socket address) paths to an endpoint,
//! failure memory, and candidate enumeration.

mod db;
mod selector;

pub use db::RouteDatabase;
pub use selector::{RouteSelector, Selection};

use std::fmt;
use std::net::SocketAddr;

use crate::endpoint::Endpoint;
use crate::proxy::Proxy;

/// One concrete way to reach an endpoint: through `proxy`, at
/// `socket_addr`. For SOCKS proxies the address may be unresolved, in
/// which case only host and port are meaningful.
#[derive(Clone)]
pub struct Route {
    pub endpoint: Endpoint,
    pub proxy: Proxy,
    pub socket_addr: SocketAddr,
    /// Hostname the socket address was resolved from; kept for SOCKS
    /// relays which receive the name, not the address.
    pub socket_host: String,
}

impl Route {
    pub fn new(
        endpoint: Endpoint,
        proxy: Proxy,
        socket_addr: SocketAddr,
        socket_host: impl Into<String>,
    ) -> Self {
        Self {
            endpoint,
            proxy,
            socket_addr,
            socket_host: socket_host.into(),
        }
    }

    /// An https connection through an HTTP proxy must open a CONNECT
    /// tunnel first.
    pub fn requires_tunnel(&self) -> bool {
        self.endpoint.is_https() && matches!(self.proxy, Proxy::Http { .. })
    }
}

impl PartialEq for Route {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint
            && self.proxy == other.proxy
            && self.socket_addr == other.socket_addr
    }
}

impl Eq for Route {}

impl std::hash::Hash for Route {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.endpoint.host().hash(state);
        self.endpoint.port().hash(state);
        self.proxy.hash(state);
        self.socket_addr.hash(state);
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} via {} at {}",
            self.endpoint.host(),
            self.endpoint.port(),
            self.proxy,
            self.socket_addr
        )
    }
}
