//! Response cache: storage seam, entry metadata codec, and hit accounting.
//!
//! The journaled on-disk store is an external collaborator behind
//! [`CacheStore`]; an in-memory store is provided for tests and small
//! deployments. Entry metadata uses a line-oriented UTF-8 format so disk
//! entries stay inspectable.

mod control;
mod strategy;

pub use control::CacheControl;
pub use strategy::CacheStrategy;

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;
use md5::{Digest as _, Md5};

use crate::body::{Body, BodyReader};
use crate::error::{Error, Result};
use crate::headers::{has_vary_all, vary_headers, vary_matches};
use crate::protocol::Protocol;
use crate::request::Request;
use crate::response::Response;
use crate::tls::{Certificate, CipherSuite, Handshake, TlsVersion};

const SENT_MILLIS_HEADER: &str = "kestrel-sent-millis";
const RECEIVED_MILLIS_HEADER: &str = "kestrel-received-millis";

/// A stored entry: metadata stream and body stream.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub metadata: Bytes,
    pub body: Bytes,
}

/// Storage seam for cache entries, keyed by `md5(url)` in lowercase hex.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<StoreSnapshot>>;
    async fn put(&self, key: &str, metadata: Bytes, body: Bytes) -> Result<()>;
    /// Replace an existing entry's metadata, keeping its body. A missing
    /// entry is a no-op.
    async fn update_metadata(&self, key: &str, metadata: Bytes) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Hash-map backed store.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: Mutex<HashMap<String, StoreSnapshot>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<StoreSnapshot>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &str, metadata: Bytes, body: Bytes) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), StoreSnapshot { metadata, body });
        Ok(())
    }

    async fn update_metadata(&self, key: &str, metadata: Bytes) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(snapshot) = entries.get_mut(key) {
            snapshot.metadata = metadata;
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }
}

/// The response cache used by the cache interceptor.
pub struct Cache {
    store: Box<dyn CacheStore>,
    request_count: AtomicU64,
    network_count: AtomicU64,
    hit_count: AtomicU64,
}

impl Cache {
    pub fn new(store: Box<dyn CacheStore>) -> Self {
        Self {
            store,
            request_count: AtomicU64::new(0),
            network_count: AtomicU64::new(0),
            hit_count: AtomicU64::new(0),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(InMemoryCacheStore::new()))
    }

    /// Cache key for a URL.
    pub fn key(url: &url::Url) -> String {
        hex::encode(Md5::digest(url.as_str().as_bytes()))
    }

    /// Look up a stored response usable for `request`, or None.
    pub async fn get(&self, request: &Request) -> Result<Option<Response>> {
        let key = Self::key(request.url());
        let Some(snapshot) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let entry = match CacheEntry::parse(&snapshot.metadata) {
            Ok(entry) => entry,
            Err(e) => {
                // A corrupt entry is dropped, not surfaced.
                tracing::warn!(key = %key, error = %e, "dropping unreadable cache entry");
                self.store.remove(&key).await?;
                return Ok(None);
            }
        };
        if !entry.matches(request) {
            return Ok(None);
        }
        Ok(Some(entry.into_response(snapshot.body)?))
    }

    /// Begin storing `response`. Returns None when the response is not
    /// storable; otherwise a commit handle the body tee completes.
    pub fn prepare_put(&self, response: &Response) -> Option<PendingStore> {
        if response.request().method() != Method::GET {
            return None;
        }
        if has_vary_all(response.headers()) {
            return None;
        }
        if response.request().is_https() && response.handshake().is_none() {
            // An https entry without its handshake could never be served.
            return None;
        }
        let entry = CacheEntry::from_response(response);
        Some(PendingStore {
            key: Self::key(response.request().url()),
            metadata: entry.serialize(),
        })
    }

    pub(crate) async fn commit(&self, pending: PendingStore, body: Bytes) -> Result<()> {
        self.store.put(&pending.key, pending.metadata, body).await
    }

    /// Refresh a stored entry's metadata after a 304 validated it.
    pub async fn update(&self, merged: &Response) -> Result<()> {
        let entry = CacheEntry::from_response(merged);
        self.store
            .update_metadata(&Self::key(merged.request().url()), entry.serialize())
            .await
    }

    /// Drop the entry for `request`'s URL, if any.
    pub async fn remove(&self, request: &Request) -> Result<()> {
        self.store.remove(&Self::key(request.url())).await
    }

    pub(crate) fn track_strategy(&self, strategy: &CacheStrategy) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        if strategy.network_request.is_some() {
            self.network_count.fetch_add(1, Ordering::Relaxed);
        } else if strategy.cache_response.is_some() {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn track_conditional_hit(&self) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn network_count(&self) -> u64 {
        self.network_count.load(Ordering::Relaxed)
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("request_count", &self.request_count())
            .field("network_count", &self.network_count())
            .field("hit_count", &self.hit_count())
            .finish()
    }
}

/// Metadata for an entry awaiting its body.
#[derive(Debug)]
pub struct PendingStore {
    key: String,
    metadata: Bytes,
}

/// Tees body bytes into a buffer, committing the cache entry when the
/// body reaches EOF. Dropping the reader early abandons the entry.
pub(crate) struct CacheWritingReader {
    inner: Box<dyn BodyReader>,
    pending: Option<PendingStore>,
    buffer: Vec<u8>,
    cache: std::sync::Arc<Cache>,
}

impl CacheWritingReader {
    pub(crate) fn new(
        inner: Box<dyn BodyReader>,
        pending: PendingStore,
        cache: std::sync::Arc<Cache>,
    ) -> Self {
        Self {
            inner,
            pending: Some(pending),
            buffer: Vec::new(),
            cache,
        }
    }
}

#[async_trait]
impl BodyReader for CacheWritingReader {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf).await?;
        if n > 0 {
            self.buffer.extend_from_slice(&buf[..n]);
        } else if let Some(pending) = self.pending.take() {
            let body = Bytes::from(std::mem::take(&mut self.buffer));
            if let Err(e) = self.cache.commit(pending, body).await {
                tracing::warn!(error = %e, "cache write-back failed");
            }
        }
        Ok(n)
    }
}

/// A parsed cache entry: everything except the body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    url: String,
    request_method: String,
    vary_headers: HeaderMap,
    protocol: Protocol,
    status: u16,
    message: String,
    response_headers: HeaderMap,
    handshake: Option<Handshake>,
    sent_request_millis: i64,
    received_response_millis: i64,
}

impl CacheEntry {
    pub fn from_response(response: &Response) -> Self {
        Self {
            url: response.request().url().as_str().to_string(),
            request_method: response.request().method().as_str().to_string(),
            vary_headers: vary_headers(response.request().headers(), response.headers()),
            protocol: response.protocol(),
            status: response.status(),
            message: response.message().to_string(),
            response_headers: response.headers().clone(),
            handshake: response.handshake().cloned(),
            sent_request_millis: response.sent_request_at_millis(),
            received_response_millis: response.received_response_at_millis(),
        }
    }

    fn is_https(&self) -> bool {
        self.url.starts_with("https://")
    }

    /// Whether this entry may answer `request`: same URL and method, and
    /// the headers the stored response varied on are unchanged.
    pub fn matches(&self, request: &Request) -> bool {
        self.url == request.url().as_str()
            && self.request_method == request.method().as_str()
            && vary_matches(
                &self.vary_headers,
                &self.response_headers,
                request.headers(),
            )
    }

    /// Rebuild the stored response around `body`.
    pub fn into_response(self, body: Bytes) -> Result<Response> {
        let mut request_builder = Request::builder()
            .url(&self.url)?
            .method(
                self.request_method
                    .parse::<Method>()
                    .map_err(|_| Error::protocol("bad stored method"))?,
            );
        request_builder = request_builder.headers(self.vary_headers.clone());
        let request = request_builder.build()?;

        let content_type = crate::headers::header_str(&self.response_headers, "content-type")
            .map(str::to_string);
        let mut headers = self.response_headers;
        headers.remove(SENT_MILLIS_HEADER);
        headers.remove(RECEIVED_MILLIS_HEADER);

        Response::builder()
            .request(request)
            .protocol(self.protocol)
            .status(self.status)
            .message(self.message)
            .headers(headers)
            .handshake(self.handshake)
            .sent_request_at_millis(self.sent_request_millis)
            .received_response_at_millis(self.received_response_millis)
            .body(Body::from_bytes(body, content_type))
            .build()
    }

    /// Serialize to the line-oriented metadata format.
    pub fn serialize(&self) -> Bytes {
        let mut out = String::new();
        out.push_str(&self.url);
        out.push('\n');
        out.push_str(&self.request_method);
        out.push('\n');
        let vary: Vec<(String, String)> = header_lines(&self.vary_headers);
        out.push_str(&vary.len().to_string());
        out.push('\n');
        for (name, value) in &vary {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
        out.push_str(&format!(
            "{} {} {}\n",
            self.protocol.status_line_token(),
            self.status,
            self.message
        ));
        let response: Vec<(String, String)> = header_lines(&self.response_headers);
        out.push_str(&(response.len() + 2).to_string());
        out.push('\n');
        for (name, value) in &response {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
        out.push_str(&format!(
            "{SENT_MILLIS_HEADER}: {}\n{RECEIVED_MILLIS_HEADER}: {}\n",
            self.sent_request_millis, self.received_response_millis
        ));
        if self.is_https() {
            out.push('\n');
            if let Some(handshake) = &self.handshake {
                out.push_str(handshake.cipher_suite.name());
                out.push('\n');
                write_certificates(&mut out, &handshake.peer_certificates);
                write_certificates(&mut out, &handshake.local_certificates);
                out.push_str(handshake.tls_version.java_name());
                out.push('\n');
            }
        }
        Bytes::from(out)
    }

    /// Parse the line-oriented metadata format.
    pub fn parse(metadata: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(metadata)
            .map_err(|_| Error::Cache("metadata is not UTF-8".into()))?;
        let mut lines = text.split('\n');
        let mut next = || {
            lines
                .next()
                .ok_or_else(|| Error::Cache("truncated metadata".into()))
        };

        let url = next()?.to_string();
        let request_method = next()?.to_string();
        let vary_count: usize = next()?
            .parse()
            .map_err(|_| Error::Cache("bad vary count".into()))?;
        let mut vary_headers = HeaderMap::new();
        for _ in 0..vary_count {
            append_header_line(&mut vary_headers, next()?)?;
        }

        let status_line = next()?;
        let (protocol, status, message) = parse_status_line(status_line)?;

        let response_count: usize = next()?
            .parse()
            .map_err(|_| Error::Cache("bad header count".into()))?;
        let mut response_headers = HeaderMap::new();
        for _ in 0..response_count {
            append_header_line(&mut response_headers, next()?)?;
        }
        let sent_request_millis =
            take_millis_header(&mut response_headers, SENT_MILLIS_HEADER)?;
        let received_response_millis =
            take_millis_header(&mut response_headers, RECEIVED_MILLIS_HEADER)?;

        let handshake = if url.starts_with("https://") {
            let blank = next()?;
            if !blank.is_empty() {
                return Err(Error::Cache(format!("expected blank line, got {blank:?}")));
            }
            let cipher_suite = CipherSuite::from_name(next()?);
            let peer_certificates = read_certificates(&mut lines)?;
            let local_certificates = read_certificates(&mut lines)?;
            // Legacy entries predate the TLS version line.
            let tls_version = match lines.next() {
                Some(line) if !line.is_empty() => TlsVersion::from_java_name(line)
                    .map_err(|e| Error::Cache(e.to_string()))?,
                _ => TlsVersion::Ssl30,
            };
            Some(
                Handshake::new(tls_version, cipher_suite)
                    .with_peer_certificates(peer_certificates)
                    .with_local_certificates(local_certificates),
            )
        } else {
            None
        };

        Ok(Self {
            url,
            request_method,
            vary_headers,
            protocol,
            status,
            message,
            response_headers,
            handshake,
            sent_request_millis,
            received_response_millis,
        })
    }
}

fn header_lines(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.push((name.as_str().to_string(), value.to_string()));
        }
    }
    out
}

fn append_header_line(headers: &mut HeaderMap, line: &str) -> Result<()> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| Error::Cache(format!("malformed header line: {line:?}")))?;
    let name: HeaderName = name
        .trim()
        .parse()
        .map_err(|_| Error::Cache(format!("bad header name: {name:?}")))?;
    let value: HeaderValue = value
        .trim()
        .parse()
        .map_err(|_| Error::Cache("bad header value".into()))?;
    headers.append(name, value);
    Ok(())
}

fn take_millis_header(headers: &mut HeaderMap, name: &str) -> Result<i64> {
    let value = headers
        .remove(name)
        .ok_or_else(|| Error::Cache(format!("missing {name}")))?;
    value
        .to_str()
        .ok()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::Cache(format!("bad {name}")))
}

fn parse_status_line(line: &str) -> Result<(Protocol, u16, String)> {
    let mut parts = line.splitn(3, ' ');
    let proto = parts
        .next()
        .ok_or_else(|| Error::Cache("empty status line".into()))?;
    let protocol = match proto {
        "HTTP/1.0" => Protocol::Http10,
        "HTTP/1.1" => Protocol::Http11,
        "HTTP/2" => Protocol::H2,
        "HTTP/3" => Protocol::Quic,
        "spdy/3.1" => Protocol::Spdy3,
        other => return Err(Error::Cache(format!("bad protocol: {other:?}"))),
    };
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Cache("bad status code".into()))?;
    let message = parts.next().unwrap_or("").to_string();
    Ok((protocol, status, message))
}

fn write_certificates(out: &mut String, certificates: &[Certificate]) {
    out.push_str(&certificates.len().to_string());
    out.push('\n');
    for cert in certificates {
        out.push_str(&BASE64.encode(&cert.der));
        out.push('\n');
    }
}

fn read_certificates<'a>(
    lines: &mut impl Iterator<Item = &'a str>,
) -> Result<Vec<Certificate>> {
    let count_line = lines
        .next()
        .ok_or_else(|| Error::Cache("truncated certificate list".into()))?;
    let count: i64 = count_line
        .parse()
        .map_err(|_| Error::Cache(format!("bad certificate count: {count_line:?}")))?;
    if count < 0 {
        return Ok(Vec::new());
    }
    let mut certificates = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let line = lines
            .next()
            .ok_or_else(|| Error::Cache("truncated certificate".into()))?;
        let der = BASE64
            .decode(line)
            .map_err(|e| Error::Cache(format!("bad certificate base64: {e}")))?;
        certificates.push(Certificate::new(der, Bytes::new()));
    }
    Ok(certificates)
}
