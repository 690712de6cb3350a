//! Client assembly: configuration, collaborators, and call creation.

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::auth::{Authenticator, NoAuthenticator};
use crate::cache::Cache;
use crate::call::Call;
use crate::connect::{CodecFactory, ConnectionPool, UnconfiguredCodecFactory};
use crate::cookie::{CookieJar, NoCookieJar};
use crate::dispatcher::Dispatcher;
use crate::dns::{Dns, SystemDns};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::interceptor::Interceptor;
use crate::pinning::CertificatePinner;
use crate::protocol::Protocol;
use crate::proxy::{NoProxySelector, Proxy, ProxySelector};
use crate::request::Request;
use crate::route::RouteDatabase;
use crate::transport::{HostnameVerifier, SocketFactory, TcpSocketFactory, TlsConnector};

/// Everything a call needs from its client, shared by reference.
pub struct ClientCore {
    pub dispatcher: Dispatcher,
    pub pool: ConnectionPool,
    pub route_database: Arc<RouteDatabase>,
    pub cache: Option<Arc<Cache>>,
    pub cookie_jar: Arc<dyn CookieJar>,
    pub dns: Arc<dyn Dns>,
    pub proxy: Option<Proxy>,
    pub proxy_selector: Arc<dyn ProxySelector>,
    pub socket_factory: Arc<dyn SocketFactory>,
    pub tls_connector: Option<Arc<dyn TlsConnector>>,
    pub hostname_verifier: Option<Arc<dyn HostnameVerifier>>,
    pub certificate_pinner: Option<Arc<CertificatePinner>>,
    pub authenticator: Arc<dyn Authenticator>,
    pub proxy_authenticator: Arc<dyn Authenticator>,
    pub protocols: Vec<Protocol>,
    pub retry_on_connection_failure: bool,
    pub follow_redirects: bool,
    pub follow_ssl_redirects: bool,
    pub connect_timeout: Duration,
    /// Enforced at the codec/socket layer; codec factories read it here.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub call_timeout: Option<Duration>,
    pub interceptors: Vec<Arc<dyn Interceptor>>,
    pub network_interceptors: Vec<Arc<dyn Interceptor>>,
    pub codec_factory: Arc<dyn CodecFactory>,
    pub user_agent: String,
}

impl ClientCore {
    /// The endpoint identity for a request URL. Path and query do not
    /// participate; calls to the same endpoint may share connections.
    pub fn endpoint_for(&self, url: &Url) -> Result<Endpoint> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::UnsupportedUrl("missing host".into()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::UnsupportedUrl("missing port".into()))?;
        let (tls_connector, hostname_verifier, certificate_pinner) = if url.scheme() == "https" {
            let tls = self
                .tls_connector
                .clone()
                .ok_or_else(|| Error::tls("no TLS connector configured for https"))?;
            (
                Some(tls),
                self.hostname_verifier.clone(),
                self.certificate_pinner.clone(),
            )
        } else {
            (None, None, None)
        };
        Endpoint::new(
            host,
            port,
            Arc::clone(&self.dns),
            Arc::clone(&self.socket_factory),
            tls_connector,
            hostname_verifier,
            certificate_pinner,
            self.proxy.clone(),
            Arc::clone(&self.proxy_selector),
            self.protocols.clone(),
            Arc::clone(&self.proxy_authenticator),
        )
    }
}

/// An HTTP client: a bundle of configuration plus shared dispatcher,
/// connection pool, and cache. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct HttpClient {
    core: Arc<ClientCore>,
}

impl HttpClient {
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::new()
    }

    /// A client with all defaults.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Prepare `request` for execution.
    pub fn new_call(&self, request: Request) -> Call {
        Call::new(Arc::clone(&self.core), request)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.core.dispatcher
    }

    pub fn connection_pool(&self) -> &ConnectionPool {
        &self.core.pool
    }

    pub fn cache(&self) -> Option<&Arc<Cache>> {
        self.core.cache.as_ref()
    }

    /// Cancel all calls, evict idle connections, and drop the runtime's
    /// grip on shared resources. Call when the client is done for good.
    pub fn shutdown(&self) {
        self.core.dispatcher.cancel_all();
        self.core.pool.evict_all();
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("dispatcher", &self.core.dispatcher)
            .field("pool", &self.core.pool)
            .finish()
    }
}

/// Builder for [`HttpClient`].
pub struct HttpClientBuilder {
    dispatcher: Option<Dispatcher>,
    pool: Option<ConnectionPool>,
    cache: Option<Arc<Cache>>,
    cookie_jar: Arc<dyn CookieJar>,
    dns: Arc<dyn Dns>,
    proxy: Option<Proxy>,
    proxy_selector: Arc<dyn ProxySelector>,
    socket_factory: Arc<dyn SocketFactory>,
    tls_connector: Option<Arc<dyn TlsConnector>>,
    hostname_verifier: Option<Arc<dyn HostnameVerifier>>,
    certificate_pinner: Option<Arc<CertificatePinner>>,
    authenticator: Arc<dyn Authenticator>,
    proxy_authenticator: Arc<dyn Authenticator>,
    protocols: Vec<Protocol>,
    retry_on_connection_failure: bool,
    follow_redirects: bool,
    follow_ssl_redirects: bool,
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    call_timeout: Option<Duration>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    network_interceptors: Vec<Arc<dyn Interceptor>>,
    codec_factory: Arc<dyn CodecFactory>,
    user_agent: String,
}

impl HttpClientBuilder {
    pub fn new() -> Self {
        Self {
            dispatcher: None,
            pool: None,
            cache: None,
            cookie_jar: Arc::new(NoCookieJar),
            dns: Arc::new(SystemDns),
            proxy: None,
            proxy_selector: Arc::new(NoProxySelector),
            socket_factory: Arc::new(TcpSocketFactory),
            tls_connector: None,
            hostname_verifier: None,
            certificate_pinner: None,
            authenticator: Arc::new(NoAuthenticator),
            proxy_authenticator: Arc::new(NoAuthenticator),
            protocols: vec![Protocol::H2, Protocol::Http11],
            retry_on_connection_failure: true,
            follow_redirects: true,
            follow_ssl_redirects: true,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            call_timeout: None,
            interceptors: Vec::new(),
            network_interceptors: Vec::new(),
            codec_factory: Arc::new(UnconfiguredCodecFactory),
            user_agent: concat!("kestrel/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn connection_pool(mut self, pool: ConnectionPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn cache(mut self, cache: Cache) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    pub fn cookie_jar(mut self, jar: Arc<dyn CookieJar>) -> Self {
        self.cookie_jar = jar;
        self
    }

    pub fn dns(mut self, dns: Arc<dyn Dns>) -> Self {
        self.dns = dns;
        self
    }

    pub fn proxy(mut self, proxy: Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn proxy_selector(mut self, selector: Arc<dyn ProxySelector>) -> Self {
        self.proxy_selector = selector;
        self
    }

    pub fn socket_factory(mut self, factory: Arc<dyn SocketFactory>) -> Self {
        self.socket_factory = factory;
        self
    }

    pub fn tls_connector(mut self, connector: Arc<dyn TlsConnector>) -> Self {
        self.tls_connector = Some(connector);
        self
    }

    pub fn hostname_verifier(mut self, verifier: Arc<dyn HostnameVerifier>) -> Self {
        self.hostname_verifier = Some(verifier);
        self
    }

    pub fn certificate_pinner(mut self, pinner: CertificatePinner) -> Self {
        self.certificate_pinner = Some(Arc::new(pinner));
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn proxy_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.proxy_authenticator = authenticator;
        self
    }

    pub fn protocols(mut self, protocols: Vec<Protocol>) -> Self {
        self.protocols = protocols;
        self
    }

    pub fn retry_on_connection_failure(mut self, retry: bool) -> Self {
        self.retry_on_connection_failure = retry;
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    /// Gate redirects that cross between http and https.
    pub fn follow_ssl_redirects(mut self, follow: bool) -> Self {
        self.follow_ssl_redirects = follow;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Deadline for the entire call, retries and follow-ups included.
    /// Disabled by default.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Add an application interceptor: runs before the retry loop, sees
    /// each call once.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Add a network interceptor: runs after the cache with a live
    /// exchange, once per network attempt.
    pub fn network_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.network_interceptors.push(interceptor);
        self
    }

    pub fn codec_factory(mut self, factory: Arc<dyn CodecFactory>) -> Self {
        self.codec_factory = factory;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn build(self) -> Result<HttpClient> {
        Protocol::validate_selection(&self.protocols)?;
        Ok(HttpClient {
            core: Arc::new(ClientCore {
                dispatcher: self.dispatcher.unwrap_or_default(),
                pool: self.pool.unwrap_or_default(),
                route_database: Arc::new(RouteDatabase::new()),
                cache: self.cache,
                cookie_jar: self.cookie_jar,
                dns: self.dns,
                proxy: self.proxy,
                proxy_selector: self.proxy_selector,
                socket_factory: self.socket_factory,
                tls_connector: self.tls_connector,
                hostname_verifier: self.hostname_verifier,
                certificate_pinner: self.certificate_pinner,
                authenticator: self.authenticator,
                proxy_authenticator: self.proxy_authenticator,
                protocols: self.protocols,
                retry_on_connection_failure: self.retry_on_connection_failure,
                follow_redirects: self.follow_redirects,
                follow_ssl_redirects: self.follow_ssl_redirects,
                connect_timeout: self.connect_timeout,
                read_timeout: self.read_timeout,
                write_timeout: self.write_timeout,
                call_timeout: self.call_timeout,
                interceptors: self.interceptors,
                network_interceptors: self.network_interceptors,
                codec_factory: self.codec_factory,
                user_agent: self.user_agent,
            }),
        })
    }
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
