//! Transport seams: raw sockets and the TLS collaborator.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{Error, Result, TimeoutKind};
use crate::protocol::Protocol;
use crate::tls::Handshake;

/// A connected byte stream. Dropping it closes the underlying socket.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Opens raw sockets for a route's target address.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn connect(
        &self,
        addr: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<Box<dyn Transport>>;
}

/// Plain TCP via tokio, with `TCP_NODELAY` set.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpSocketFactory;

#[async_trait]
impl SocketFactory for TcpSocketFactory {
    async fn connect(
        &self,
        addr: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<Box<dyn Transport>> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::timeout(TimeoutKind::Connect))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Result of a TLS handshake: the encrypted stream, what was negotiated,
/// and which protocol ALPN selected (if any).
pub struct TlsSession {
    pub stream: Box<dyn Transport>,
    pub handshake: Handshake,
    pub alpn: Option<Protocol>,
}

/// Performs TLS handshakes. External collaborator; the core only consumes
/// the resulting [`TlsSession`].
#[async_trait]
pub trait TlsConnector: Send + Sync {
    async fn handshake(
        &self,
        stream: Box<dyn Transport>,
        server_name: &str,
        alpn_protocols: &[Protocol],
    ) -> Result<TlsSession>;
}

/// Decides whether a handshake's peer certificate satisfies a hostname.
pub trait HostnameVerifier: Send + Sync {
    fn verify(&self, hostname: &str, handshake: &Handshake) -> bool;
}

/// Verifier that checks the leaf certificate's subject alternative names.
#[derive(Debug, Default, Clone, Copy)]
pub struct SanHostnameVerifier;

impl HostnameVerifier for SanHostnameVerifier {
    fn verify(&self, hostname: &str, handshake: &Handshake) -> bool {
        handshake
            .peer_certificates
            .first()
            .is_some_and(|leaf| leaf.matches_hostname(hostname))
    }
}

/// Read from `transport` until CRLF CRLF, bounded by `limit` bytes.
///
/// Used only to consume an HTTP proxy's reply to a CONNECT tunnel request;
/// the real wire codecs live outside this crate.
pub(crate) async fn read_until_headers_end(
    transport: &mut (dyn Transport + '_),
    limit: usize,
) -> Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;

    let mut buf = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    loop {
        let n = transport.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::protocol("proxy closed stream during CONNECT"));
        }
        buf.push(byte[0]);
        if buf.len() > limit {
            return Err(Error::protocol("proxy CONNECT response too large"));
        }
        if buf.ends_with(b"\r\n\r\n") {
            return Ok(buf);
        }
    }
}
