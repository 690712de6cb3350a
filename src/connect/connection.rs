//! A live connection bound to one route.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use http::header::HeaderMap;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::call::RealCall;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::protocol::Protocol;
use crate::proxy::Proxy;
use crate::request::Request;
use crate::response::Response;
use crate::route::Route;
use crate::tls::Handshake;
use crate::transport::{read_until_headers_end, SanHostnameVerifier, Transport};
use crate::transport::HostnameVerifier;

use super::codec::{CodecFactory, ExchangeCodec};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

const MAX_TUNNEL_ATTEMPTS: u32 = 3;

/// A weak reference to a call using this connection, with the context it
/// was acquired under so leaks can be attributed.
pub(crate) struct CallReference {
    pub call: Weak<RealCall>,
    pub acquired_for: String,
}

pub(crate) struct ConnectionState {
    pub no_new_exchanges: bool,
    pub no_coalesced_exchanges: bool,
    pub route_failure_count: u32,
    pub success_count: u64,
    pub refused_stream_count: u32,
    pub idle_at: Instant,
    pub allocation_limit: usize,
    pub calls: Vec<CallReference>,
}

/// A socket (or multiplexed session) bound to one [`Route`].
///
/// Created by the exchange finder, owned by the connection pool,
/// destroyed when idle-evicted, explicitly closed, or detected leaked.
pub struct RealConnection {
    id: u64,
    route: Route,
    protocol: Protocol,
    handshake: Option<Handshake>,
    codec_factory: Arc<dyn CodecFactory>,
    transport: Mutex<Option<Box<dyn Transport>>>,
    state: Mutex<ConnectionState>,
}

impl RealConnection {
    /// Wrap an already-established transport. This is the seam external
    /// transports (and tests) use to hand the core a live connection.
    pub fn from_parts(
        route: Route,
        transport: Option<Box<dyn Transport>>,
        protocol: Protocol,
        handshake: Option<Handshake>,
        codec_factory: Arc<dyn CodecFactory>,
    ) -> Arc<Self> {
        let connection = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            route,
            protocol,
            handshake,
            codec_factory: codec_factory.clone(),
            transport: Mutex::new(transport),
            state: Mutex::new(ConnectionState {
                no_new_exchanges: false,
                no_coalesced_exchanges: false,
                route_failure_count: 0,
                success_count: 0,
                refused_stream_count: 0,
                idle_at: Instant::now(),
                allocation_limit: 1,
                calls: Vec::new(),
            }),
        });
        let limit = codec_factory.allocation_limit(&connection);
        connection.lock_state().allocation_limit = limit;
        connection
    }

    /// Establish a connection on `route`: TCP, an optional proxy tunnel,
    /// an optional TLS handshake, then certificate checks.
    pub async fn connect(
        route: Route,
        codec_factory: Arc<dyn CodecFactory>,
        connect_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let endpoint = &route.endpoint;
        let mut transport = endpoint
            .socket_factory
            .connect(route.socket_addr, connect_timeout)
            .await?;
        tracing::debug!(
            addr = %route.socket_addr,
            proxy = %route.proxy,
            "tcp connected"
        );

        if route.requires_tunnel() {
            transport = create_tunnel(transport, &route).await?;
        }

        let (transport, protocol, handshake) = if let Some(tls) = &endpoint.tls_connector {
            let session = tls
                .handshake(transport, endpoint.host(), &endpoint.protocols)
                .await?;
            let verified = match &endpoint.hostname_verifier {
                Some(verifier) => verifier.verify(endpoint.host(), &session.handshake),
                None => SanHostnameVerifier.verify(endpoint.host(), &session.handshake),
            };
            if !verified {
                return Err(Error::PeerUnverified {
                    host: endpoint.host().to_string(),
                });
            }
            if let Some(pinner) = &endpoint.certificate_pinner {
                pinner.check(endpoint.host(), &session.handshake.peer_certificates)?;
            }
            let protocol = session.alpn.unwrap_or(Protocol::Http11);
            (session.stream, protocol, Some(session.handshake))
        } else if endpoint.protocols == [Protocol::H2PriorKnowledge] {
            (transport, Protocol::H2PriorKnowledge, None)
        } else {
            (transport, Protocol::Http11, None)
        };

        tracing::debug!(
            host = endpoint.host(),
            protocol = %protocol,
            "connection established"
        );
        Ok(Self::from_parts(
            route,
            Some(transport),
            protocol,
            handshake,
            codec_factory,
        ))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    pub fn is_multiplexed(&self) -> bool {
        self.protocol.is_multiplexed()
    }

    pub fn new_codec(&self) -> Result<Box<dyn ExchangeCodec>> {
        self.codec_factory.new_codec(self)
    }

    pub(crate) fn lock_state(&self) -> std::sync::MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stop accepting exchanges; in-flight exchanges finish undisturbed.
    pub fn no_new_exchanges(&self) {
        self.lock_state().no_new_exchanges = true;
    }

    /// Stop offering this connection to coalesced hosts (421 handling).
    pub fn no_coalesced_exchanges(&self) {
        self.lock_state().no_coalesced_exchanges = true;
    }

    pub fn is_no_new_exchanges(&self) -> bool {
        self.lock_state().no_new_exchanges
    }

    pub fn success_count(&self) -> u64 {
        self.lock_state().success_count
    }

    pub fn route_failure_count(&self) -> u32 {
        self.lock_state().route_failure_count
    }

    pub fn idle_at(&self) -> Instant {
        self.lock_state().idle_at
    }

    pub(crate) fn set_idle_at(&self, at: Instant) {
        self.lock_state().idle_at = at;
    }

    /// Whether a request to `url` may ride this connection: same origin,
    /// or a coalesced host covered by the peer certificate.
    pub fn supports_url(&self, url: &Url) -> bool {
        let endpoint = &self.route.endpoint;
        if url.port_or_known_default() != Some(endpoint.port()) {
            return false;
        }
        let Some(url_host) = url.host_str() else {
            return false;
        };
        if url_host.eq_ignore_ascii_case(endpoint.host()) {
            return url.scheme() == endpoint.scheme();
        }
        // Coalesced hosts need a multiplexed connection, coalescing not
        // declined (421), and a certificate that covers them.
        self.is_multiplexed()
            && url.scheme() == "https"
            && !self.lock_state().no_coalesced_exchanges
            && self
                .handshake
                .as_ref()
                .and_then(|h| h.peer_certificates.first())
                .is_some_and(|leaf| leaf.matches_hostname(url_host))
    }

    /// Whether this connection may carry a new exchange to `endpoint`.
    ///
    /// `routes` is the candidate route list for the endpoint, used to
    /// allow HTTP/2 coalescing across hostnames that share an address.
    pub fn is_eligible(&self, endpoint: &Endpoint, routes: Option<&[Route]>) -> bool {
        let state = self.lock_state();
        if state.calls.len() >= state.allocation_limit || state.no_new_exchanges {
            return false;
        }
        if !self.route.endpoint.equal_non_host_fields(endpoint) {
            return false;
        }
        if endpoint.host().eq_ignore_ascii_case(self.route.endpoint.host()) {
            return true;
        }

        // Coalescing: HTTP/2 only.
        if !self.is_multiplexed() || state.no_coalesced_exchanges {
            return false;
        }
        drop(state);

        // The connection's address must be one the endpoint also resolves
        // to, through a direct route.
        let Some(routes) = routes else { return false };
        let ip_matches = routes.iter().any(|candidate| {
            candidate.proxy.is_direct()
                && self.route.proxy.is_direct()
                && candidate.socket_addr == self.route.socket_addr
        });
        if !ip_matches {
            return false;
        }

        // The certificate must cover the new hostname, and any pins for
        // it must hold.
        let Some(handshake) = &self.handshake else {
            return false;
        };
        let verified = match &endpoint.hostname_verifier {
            Some(verifier) => verifier.verify(endpoint.host(), handshake),
            None => SanHostnameVerifier.verify(endpoint.host(), handshake),
        };
        if !verified {
            return false;
        }
        if let Some(pinner) = &endpoint.certificate_pinner {
            if pinner
                .check(endpoint.host(), &handshake.peer_certificates)
                .is_err()
            {
                return false;
            }
        }
        true
    }

    /// Connection health ahead of carrying a new exchange. Extensive
    /// checks are requested for requests that are unsafe to replay.
    pub fn is_healthy(&self, extensive: bool) -> bool {
        {
            let state = self.lock_state();
            if state.no_new_exchanges {
                return false;
            }
        }
        let transport = self.transport.lock().unwrap_or_else(|e| e.into_inner());
        if transport.is_none() {
            return false;
        }
        if extensive && !self.is_multiplexed() {
            // An HTTP/1 socket idle long enough may be half-closed by the
            // peer without us noticing until the write fails.
            let idle = self.idle_at().elapsed();
            if idle >= Duration::from_secs(10) {
                return false;
            }
        }
        true
    }

    /// Classify a mid-exchange failure and update reuse accounting.
    pub fn track_failure(&self, error: &Error) {
        let mut state = self.lock_state();
        match error.root() {
            Error::RefusedStream => {
                state.refused_stream_count += 1;
                // A second refusal stops new exchanges on this connection.
                if state.refused_stream_count > 1 {
                    state.no_new_exchanges = true;
                    state.route_failure_count += 1;
                }
            }
            Error::Shutdown => {
                // Graceful shutdown: finish what is running, start nothing.
                state.no_new_exchanges = true;
            }
            _ => {
                state.no_new_exchanges = true;
                state.route_failure_count += 1;
            }
        }
    }

    /// Close the socket. Safe to call from any task, repeatedly.
    pub fn cancel(&self) {
        let mut transport = self.transport.lock().unwrap_or_else(|e| e.into_inner());
        *transport = None;
    }

    /// Take the transport for teardown outside a lock.
    pub(crate) fn take_transport(&self) -> Option<Box<dyn Transport>> {
        let mut transport = self.transport.lock().unwrap_or_else(|e| e.into_inner());
        transport.take()
    }

    pub(crate) fn attach_call(&self, call: &Arc<RealCall>) {
        let mut state = self.lock_state();
        state.calls.push(CallReference {
            call: Arc::downgrade(call),
            acquired_for: call.request_line(),
        });
    }

    /// Remove `call`'s reference; returns true when the connection became
    /// idle as a result.
    pub(crate) fn remove_call(&self, call: &RealCall) -> bool {
        let mut state = self.lock_state();
        let before = state.calls.len();
        state
            .calls
            .retain(|reference| !std::ptr::eq(reference.call.as_ptr(), call));
        if state.calls.len() == before {
            return false;
        }
        if state.calls.is_empty() {
            state.idle_at = Instant::now();
            true
        } else {
            false
        }
    }

    pub(crate) fn record_success(&self) {
        self.lock_state().success_count += 1;
    }

    pub fn active_call_count(&self) -> usize {
        self.lock_state().calls.len()
    }
}

impl std::fmt::Debug for RealConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealConnection")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// Open a CONNECT tunnel through an HTTP proxy, retrying with proxy
/// credentials when challenged.
async fn create_tunnel(
    mut transport: Box<dyn Transport>,
    route: &Route,
) -> Result<Box<dyn Transport>> {
    let endpoint = &route.endpoint;
    let target = format!("{}:{}", endpoint.host(), endpoint.port());
    let mut proxy_authorization: Option<String> = None;

    for _ in 0..MAX_TUNNEL_ATTEMPTS {
        let mut request = format!(
            "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: Keep-Alive\r\n"
        );
        if let Some(credentials) = &proxy_authorization {
            request.push_str("Proxy-Authorization: ");
            request.push_str(credentials);
            request.push_str("\r\n");
        }
        request.push_str("\r\n");
        transport.write_all(request.as_bytes()).await?;
        transport.flush().await?;

        let reply = read_until_headers_end(transport.as_mut(), 16 * 1024).await?;
        let (status, headers) = parse_tunnel_reply(&reply)?;
        match status {
            200 => return Ok(transport),
            407 => {
                let challenge = tunnel_challenge_response(route, headers)?;
                match endpoint
                    .proxy_authenticator
                    .authenticate(Some(route), &challenge)
                    .await?
                {
                    Some(request) => {
                        let Some(credentials) = request.header("proxy-authorization") else {
                            return Err(Error::protocol(
                                "proxy authenticator produced no credentials",
                            ));
                        };
                        proxy_authorization = Some(credentials.to_string());
                    }
                    None => {
                        return Err(Error::protocol("failed to authenticate with proxy"));
                    }
                }
            }
            other => {
                return Err(Error::protocol(format!(
                    "unexpected CONNECT response: {other}"
                )))
            }
        }
    }
    Err(Error::protocol("too many proxy authentication attempts"))
}

fn parse_tunnel_reply(reply: &[u8]) -> Result<(u16, HeaderMap)> {
    let text = std::str::from_utf8(reply)
        .map_err(|_| Error::protocol("CONNECT reply is not UTF-8"))?;
    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| Error::protocol("empty CONNECT reply"))?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::protocol(format!("bad CONNECT status line: {status_line:?}")))?;
    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if let (Ok(name), Ok(value)) = (
                name.trim().parse::<http::header::HeaderName>(),
                value.trim().parse::<http::header::HeaderValue>(),
            ) {
                headers.append(name, value);
            }
        }
    }
    Ok((status, headers))
}

/// Synthesize the 407 response handed to the proxy authenticator.
fn tunnel_challenge_response(route: &Route, headers: HeaderMap) -> Result<Response> {
    let Proxy::Http { host, port } = &route.proxy else {
        return Err(Error::protocol("tunnel over a non-HTTP proxy"));
    };
    let request = Request::builder()
        .url(format!("http://{host}:{port}/"))?
        .build()?;
    Response::builder()
        .request(request)
        .protocol(Protocol::Http11)
        .status(407)
        .message("Proxy Authentication Required")
        .headers(headers)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunnel_reply_parses_status_and_headers() {
        let reply = b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"px\"\r\n\r\n";
        let (status, headers) = parse_tunnel_reply(reply).unwrap();
        assert_eq!(status, 407);
        assert_eq!(
            headers.get("proxy-authenticate").unwrap(),
            "Basic realm=\"px\""
        );
    }

    #[test]
    fn tunnel_reply_rejects_garbage() {
        assert!(parse_tunnel_reply(b"not-http\r\n\r\n").is_err());
    }
}
