//! Shared mocks: scripted exchange codecs, canned sockets, and a fake
//! TLS layer, so the core can be driven without a network.
#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};

use kestrel::body::{BodyReader, BytesReader};
use kestrel::client::HttpClientBuilder;
use kestrel::connect::{CodecFactory, ExchangeCodec, RealConnection};
use kestrel::dns::StaticDns;
use kestrel::error::{Error, Result};
use kestrel::request::{Request, RequestBody};
use kestrel::response::ResponseHead;
use kestrel::tls::{Certificate, CipherSuite, Handshake, TlsVersion};
use kestrel::transport::{SocketFactory, TlsConnector, TlsSession, Transport};
use kestrel::{Call, Callback, HttpClient, Protocol, Response};

/// One canned server reply.
pub struct ScriptedResponse {
    pub status: u16,
    pub message: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub protocol: Protocol,
    /// When set, the response is withheld until a permit is added.
    pub gate: Option<Arc<tokio::sync::Semaphore>>,
}

impl ScriptedResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            message: "Scripted".to_string(),
            headers: Vec::new(),
            body: Vec::new(),
            protocol: Protocol::Http11,
            gate: None,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn h2(mut self) -> Self {
        self.protocol = Protocol::H2;
        self
    }

    pub fn gated(mut self, gate: Arc<tokio::sync::Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }
}

struct MockShared {
    script: Mutex<VecDeque<Result<ScriptedResponse>>>,
    seen_requests: Mutex<Vec<Request>>,
    seen_bodies: Mutex<Vec<Bytes>>,
    cancel_count: AtomicUsize,
    codecs_created: AtomicUsize,
    canceled: std::sync::atomic::AtomicBool,
}

/// Hands out codecs that replay a scripted sequence of replies, one per
/// exchange, recording what the core sent.
pub struct MockCodecFactory {
    shared: Arc<MockShared>,
}

impl MockCodecFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(MockShared {
                script: Mutex::new(VecDeque::new()),
                seen_requests: Mutex::new(Vec::new()),
                seen_bodies: Mutex::new(Vec::new()),
                cancel_count: AtomicUsize::new(0),
                codecs_created: AtomicUsize::new(0),
                canceled: std::sync::atomic::AtomicBool::new(false),
            }),
        })
    }

    pub fn enqueue(&self, response: ScriptedResponse) {
        self.shared.script.lock().unwrap().push_back(Ok(response));
    }

    pub fn enqueue_error(&self, error: Error) {
        self.shared.script.lock().unwrap().push_back(Err(error));
    }

    /// Network requests the core actually wrote, in order.
    pub fn seen_requests(&self) -> Vec<Request> {
        self.shared.seen_requests.lock().unwrap().clone()
    }

    pub fn seen_bodies(&self) -> Vec<Bytes> {
        self.shared.seen_bodies.lock().unwrap().clone()
    }

    pub fn cancel_count(&self) -> usize {
        self.shared.cancel_count.load(Ordering::Acquire)
    }

    pub fn codecs_created(&self) -> usize {
        self.shared.codecs_created.load(Ordering::Acquire)
    }
}

impl CodecFactory for MockCodecFactory {
    fn new_codec(&self, _connection: &RealConnection) -> Result<Box<dyn ExchangeCodec>> {
        self.shared.codecs_created.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(MockCodec {
            shared: Arc::clone(&self.shared),
            reply: None,
        }))
    }
}

struct MockCodec {
    shared: Arc<MockShared>,
    reply: Option<ScriptedResponse>,
}

#[async_trait]
impl ExchangeCodec for MockCodec {
    async fn write_request_headers(&mut self, request: &Request) -> Result<()> {
        self.shared
            .seen_requests
            .lock()
            .unwrap()
            .push(request.clone());
        Ok(())
    }

    async fn write_request_body(&mut self, body: &RequestBody) -> Result<()> {
        self.shared
            .seen_bodies
            .lock()
            .unwrap()
            .push(body.content().clone());
        Ok(())
    }

    async fn finish_request(&mut self) -> Result<()> {
        Ok(())
    }

    async fn read_response_headers(&mut self) -> Result<ResponseHead> {
        let entry = self
            .shared
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::protocol("mock script exhausted")));
        let scripted = entry?;
        if let Some(gate) = &scripted.gate {
            // Poll the gate so a cancel can interrupt the wait, the way a
            // real codec's blocking read would be interrupted.
            loop {
                if self.shared.canceled.load(Ordering::Acquire) {
                    return Err(Error::Canceled);
                }
                tokio::select! {
                    permit = gate.acquire() => {
                        permit.map_err(|_| Error::protocol("gate closed"))?.forget();
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                }
            }
        }
        let mut headers = HeaderMap::new();
        for (name, value) in &scripted.headers {
            headers.append(
                name.parse::<HeaderName>().expect("test header name"),
                value.parse::<HeaderValue>().expect("test header value"),
            );
        }
        let head = ResponseHead {
            protocol: scripted.protocol,
            status: scripted.status,
            message: scripted.message.clone(),
            headers,
        };
        self.reply = Some(scripted);
        Ok(head)
    }

    async fn open_response_body(&mut self) -> Result<(Box<dyn BodyReader>, i64)> {
        let reply = self
            .reply
            .take()
            .ok_or_else(|| Error::protocol("body opened before headers"))?;
        let length = reply.body.len() as i64;
        Ok((Box::new(BytesReader::new(reply.body)), length))
    }

    fn canceller(&self) -> Box<dyn Fn() + Send + Sync> {
        let shared = Arc::clone(&self.shared);
        Box::new(move || {
            shared.cancel_count.fetch_add(1, Ordering::AcqRel);
            shared
                .canceled
                .store(true, std::sync::atomic::Ordering::Release);
        })
    }
}

/// Socket factory that "connects" instantly with an inert duplex pipe.
pub struct LoopbackSocketFactory {
    pub attempts: Mutex<Vec<SocketAddr>>,
}

impl LoopbackSocketFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            attempts: Mutex::new(Vec::new()),
        })
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

#[async_trait]
impl SocketFactory for LoopbackSocketFactory {
    async fn connect(
        &self,
        addr: SocketAddr,
        _connect_timeout: Duration,
    ) -> Result<Box<dyn Transport>> {
        self.attempts.lock().unwrap().push(addr);
        let (client, _server) = tokio::io::duplex(64 * 1024);
        Ok(Box::new(client))
    }
}

/// Socket factory that refuses a fixed set of addresses.
pub struct FaultySocketFactory {
    refuse: HashSet<SocketAddr>,
    pub attempts: Mutex<Vec<SocketAddr>>,
}

impl FaultySocketFactory {
    pub fn refusing(addrs: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            refuse: addrs.iter().map(|a| a.parse().unwrap()).collect(),
            attempts: Mutex::new(Vec::new()),
        })
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

#[async_trait]
impl SocketFactory for FaultySocketFactory {
    async fn connect(
        &self,
        addr: SocketAddr,
        _connect_timeout: Duration,
    ) -> Result<Box<dyn Transport>> {
        self.attempts.lock().unwrap().push(addr);
        if self.refuse.contains(&addr) {
            return Err(Error::io(format!("connection refused: {addr}")));
        }
        let (client, _server) = tokio::io::duplex(64 * 1024);
        Ok(Box::new(client))
    }
}

/// TLS layer that completes instantly with a fixed certificate and ALPN
/// outcome.
pub struct MockTlsConnector {
    pub certificate: Certificate,
    pub alpn: Option<Protocol>,
}

impl MockTlsConnector {
    pub fn new(certificate: Certificate, alpn: Option<Protocol>) -> Arc<Self> {
        Arc::new(Self { certificate, alpn })
    }
}

#[async_trait]
impl TlsConnector for MockTlsConnector {
    async fn handshake(
        &self,
        stream: Box<dyn Transport>,
        _server_name: &str,
        _alpn_protocols: &[Protocol],
    ) -> Result<TlsSession> {
        let handshake = Handshake::new(
            TlsVersion::Tls13,
            CipherSuite::from_name("TLS_AES_128_GCM_SHA256"),
        )
        .with_peer_certificates(vec![self.certificate.clone()]);
        Ok(TlsSession {
            stream,
            handshake,
            alpn: self.alpn,
        })
    }
}

/// A certificate whose SPKI and subject alternative names are arbitrary
/// test data.
pub fn test_certificate(spki: &[u8], alt_names: &[&str]) -> Certificate {
    Certificate::new(
        Bytes::copy_from_slice(b"test-der"),
        Bytes::copy_from_slice(spki),
    )
    .with_subject_alt_names(alt_names.iter().map(|s| s.to_string()).collect())
}

/// A plain-HTTP client builder wired to the mock transport stack.
pub fn test_client_builder(codecs: &Arc<MockCodecFactory>) -> HttpClientBuilder {
    HttpClient::builder()
        .dns(Arc::new(StaticDns::new(vec!["127.0.0.1".parse().unwrap()])))
        .socket_factory(LoopbackSocketFactory::new())
        .codec_factory(Arc::clone(codecs) as Arc<dyn CodecFactory>)
        .protocols(vec![Protocol::Http11])
}

pub fn test_client(codecs: &Arc<MockCodecFactory>) -> HttpClient {
    test_client_builder(codecs).build().unwrap()
}

/// Callback that forwards each terminal event into a channel.
pub struct ChannelCallback {
    sender: tokio::sync::mpsc::UnboundedSender<Result<u16>>,
}

impl ChannelCallback {
    pub fn new() -> (
        Arc<Self>,
        tokio::sync::mpsc::UnboundedReceiver<Result<u16>>,
    ) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        (Arc::new(Self { sender }), receiver)
    }
}

/// Poll `condition` until true, or panic after two seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

impl Callback for ChannelCallback {
    fn on_response(&self, _call: &Call, response: Response) {
        let _ = self.sender.send(Ok(response.status()));
    }

    fn on_failure(&self, _call: &Call, error: Error) {
        let _ = self.sender.send(Err(error));
    }
}
