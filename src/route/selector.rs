//! Enumerates candidate routes for an endpoint: the cross product of
//! proxies and resolved socket addresses, failed routes last.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::proxy::Proxy;

use super::{Route, RouteDatabase};

/// One batch of routes, produced by a single proxy's resolution.
#[derive(Debug)]
pub struct Selection {
    routes: Vec<Route>,
    index: usize,
}

impl Selection {
    fn new(routes: Vec<Route>) -> Self {
        Self { routes, index: 0 }
    }

    pub fn has_next(&self) -> bool {
        self.index < self.routes.len()
    }

    pub fn next(&mut self) -> Option<Route> {
        let route = self.routes.get(self.index).cloned()?;
        self.index += 1;
        Some(route)
    }

    /// The full snapshot, used to offer the pool a coalescing IP list.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

/// Walks `(proxy, socket address)` candidates for `endpoint`.
///
/// Routes the [`RouteDatabase`] remembers as recently failed are
/// postponed: they are only yielded after every fresh candidate has been
/// offered.
pub struct RouteSelector {
    endpoint: Endpoint,
    route_database: Arc<RouteDatabase>,
    proxies: Vec<Proxy>,
    next_proxy_index: usize,
    postponed_routes: Vec<Route>,
}

impl RouteSelector {
    pub fn new(endpoint: Endpoint, route_database: Arc<RouteDatabase>) -> Self {
        let proxies = match &endpoint.proxy {
            Some(proxy) => vec![proxy.clone()],
            None => {
                let selected = endpoint.proxy_selector.select(endpoint.url());
                if selected.is_empty() {
                    vec![Proxy::Direct]
                } else {
                    selected
                }
            }
        };
        Self {
            endpoint,
            route_database,
            proxies,
            next_proxy_index: 0,
            postponed_routes: Vec::new(),
        }
    }

    pub fn has_next(&self) -> bool {
        self.next_proxy_index < self.proxies.len() || !self.postponed_routes.is_empty()
    }

    /// Resolve the next proxy into a batch of routes.
    pub async fn next(&mut self) -> Result<Selection> {
        while self.next_proxy_index < self.proxies.len() {
            let proxy = self.proxies[self.next_proxy_index].clone();
            self.next_proxy_index += 1;

            let mut fresh = Vec::new();
            for route in self.resolve(&proxy).await? {
                if self.route_database.should_postpone(&route) {
                    self.postponed_routes.push(route);
                } else {
                    fresh.push(route);
                }
            }
            if !fresh.is_empty() {
                return Ok(Selection::new(fresh));
            }
        }
        if !self.postponed_routes.is_empty() {
            return Ok(Selection::new(std::mem::take(&mut self.postponed_routes)));
        }
        Err(Error::io(format!(
            "exhausted all routes to {}",
            self.endpoint.host()
        )))
    }

    /// Tell the proxy selector that connecting through a proxy failed.
    pub fn connect_failed(&self, route: &Route) {
        if !route.proxy.is_direct() {
            self.endpoint
                .proxy_selector
                .connect_failed(route.endpoint.url(), &route.proxy);
        }
    }

    async fn resolve(&self, proxy: &Proxy) -> Result<Vec<Route>> {
        // The socket target is the proxy itself for HTTP proxies, and the
        // origin for everything else.
        let (socket_host, socket_port) = match proxy {
            Proxy::Http { host, port } => (host.clone(), *port),
            Proxy::Direct | Proxy::Socks { .. } => {
                (self.endpoint.host().to_string(), self.endpoint.port())
            }
        };
        if socket_port == 0 {
            return Err(Error::UnsupportedUrl(format!(
                "no route to {socket_host}: port {socket_port} out of range"
            )));
        }

        if let Proxy::Socks { .. } = proxy {
            // SOCKS relays resolve the name themselves; keep it unresolved.
            let placeholder = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), socket_port);
            return Ok(vec![Route::new(
                self.endpoint.clone(),
                proxy.clone(),
                placeholder,
                socket_host,
            )]);
        }

        let addresses = self.endpoint.dns.lookup(&socket_host).await?;
        Ok(addresses
            .into_iter()
            .map(|ip| {
                Route::new(
                    self.endpoint.clone(),
                    proxy.clone(),
                    SocketAddr::new(ip, socket_port),
                    socket_host.clone(),
                )
            })
            .collect())
    }
}
