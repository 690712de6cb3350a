//! A logical endpoint: one origin plus everything needed to connect to it.

use std::fmt;
use std::sync::Arc;

use url::Url;

use crate::auth::Authenticator;
use crate::dns::Dns;
use crate::error::{Error, Result};
use crate::pinning::CertificatePinner;
use crate::protocol::Protocol;
use crate::proxy::{Proxy, ProxySelector};
use crate::transport::{HostnameVerifier, SocketFactory, TlsConnector};

/// The immutable identity of a server this client talks to, with the
/// collaborators used to reach it. Two requests with the same endpoint may
/// share a connection; URL path and query play no part in equality.
#[derive(Clone)]
pub struct Endpoint {
    scheme: &'static str,
    host: String,
    port: u16,
    root_url: Url,
    pub dns: Arc<dyn Dns>,
    pub socket_factory: Arc<dyn SocketFactory>,
    pub tls_connector: Option<Arc<dyn TlsConnector>>,
    pub hostname_verifier: Option<Arc<dyn HostnameVerifier>>,
    pub certificate_pinner: Option<Arc<CertificatePinner>>,
    pub proxy: Option<Proxy>,
    pub proxy_selector: Arc<dyn ProxySelector>,
    pub protocols: Vec<Protocol>,
    pub proxy_authenticator: Arc<dyn Authenticator>,
}

#[allow(clippy::too_many_arguments)]
impl Endpoint {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        dns: Arc<dyn Dns>,
        socket_factory: Arc<dyn SocketFactory>,
        tls_connector: Option<Arc<dyn TlsConnector>>,
        hostname_verifier: Option<Arc<dyn HostnameVerifier>>,
        certificate_pinner: Option<Arc<CertificatePinner>>,
        proxy: Option<Proxy>,
        proxy_selector: Arc<dyn ProxySelector>,
        protocols: Vec<Protocol>,
        proxy_authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self> {
        if port == 0 {
            return Err(Error::UnsupportedUrl(format!("invalid port: {port}")));
        }
        let scheme: &'static str = if tls_connector.is_some() { "https" } else { "http" };
        let host = host.into();
        let root_url = Url::parse(&format!("{scheme}://{host}:{port}/"))
            .map_err(|_| Error::UnsupportedUrl(format!("invalid host: {host}")))?;
        Ok(Self {
            scheme,
            host,
            port,
            root_url,
            dns,
            socket_factory,
            tls_connector,
            hostname_verifier,
            certificate_pinner,
            proxy,
            proxy_selector,
            protocols,
            proxy_authenticator,
        })
    }

    pub fn scheme(&self) -> &'static str {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_https(&self) -> bool {
        self.tls_connector.is_some()
    }

    /// The root URL of this endpoint.
    pub fn url(&self) -> &Url {
        &self.root_url
    }

    /// Whether `url` may be carried by a connection to this endpoint.
    pub fn supports_url(&self, url: &Url) -> bool {
        url.scheme() == self.scheme
            && url.host_str().is_some_and(|h| h.eq_ignore_ascii_case(&self.host))
            && url.port_or_known_default() == Some(self.port)
    }

    /// Equality over everything except host and port: the parts that must
    /// agree for two endpoints to share a connection to the same address.
    pub fn equal_non_host_fields(&self, other: &Endpoint) -> bool {
        arc_eq(&self.dns, &other.dns)
            && arc_eq(&self.socket_factory, &other.socket_factory)
            && opt_arc_eq(&self.tls_connector, &other.tls_connector)
            && opt_arc_eq(&self.hostname_verifier, &other.hostname_verifier)
            && match (&self.certificate_pinner, &other.certificate_pinner) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            }
            && self.proxy == other.proxy
            && arc_eq(&self.proxy_selector, &other.proxy_selector)
            && arc_eq(&self.proxy_authenticator, &other.proxy_authenticator)
            && self.protocols == other.protocols
    }
}

fn arc_eq<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::ptr_eq(a, b)
}

fn opt_arc_eq<T: ?Sized>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port && self.equal_non_host_fields(other)
    }
}

impl Eq for Endpoint {}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("proxy", &self.proxy)
            .field("protocols", &self.protocols)
            .finish()
    }
}
