//! One request/response pair carried on a connection.

use std::io;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;

use crate::body::{Body, BodyReader};
use crate::call::RealCall;
use crate::error::{Error, Result};
use crate::headers::header_str;
use crate::request::{Request, RequestBody};
use crate::response::ResponseHead;

use super::codec::ExchangeCodec;
use super::connection::RealConnection;

struct ExchangeState {
    request_done: bool,
    response_done: bool,
    reported: bool,
    failed: bool,
}

/// Transmits a single HTTP request and its response over a connection,
/// spanning one HTTP/1 request cycle or one HTTP/2 stream.
///
/// Holds its call weakly: the call owns the exchange, not the reverse.
pub struct Exchange {
    call: Weak<RealCall>,
    connection: Arc<RealConnection>,
    codec: tokio::sync::Mutex<Box<dyn ExchangeCodec>>,
    canceller: Box<dyn Fn() + Send + Sync>,
    state: Mutex<ExchangeState>,
}

impl Exchange {
    pub(crate) fn new(
        call: &Arc<RealCall>,
        connection: Arc<RealConnection>,
        codec: Box<dyn ExchangeCodec>,
    ) -> Arc<Self> {
        let canceller = codec.canceller();
        Arc::new(Self {
            call: Arc::downgrade(call),
            connection,
            codec: tokio::sync::Mutex::new(codec),
            canceller,
            state: Mutex::new(ExchangeState {
                request_done: false,
                response_done: false,
                reported: false,
                failed: false,
            }),
        })
    }

    pub fn connection(&self) -> &Arc<RealConnection> {
        &self.connection
    }

    pub async fn write_request_headers(&self, request: &Request) -> Result<()> {
        let mut codec = self.codec.lock().await;
        let result = codec.write_request_headers(request).await;
        drop(codec);
        self.abort_on_error(&result);
        result
    }

    pub async fn write_request_body(&self, body: &RequestBody) -> Result<()> {
        let mut codec = self.codec.lock().await;
        let result = codec.write_request_body(body).await;
        drop(codec);
        self.abort_on_error(&result);
        result
    }

    pub async fn finish_request(&self) -> Result<()> {
        let mut codec = self.codec.lock().await;
        let result = codec.finish_request().await;
        drop(codec);
        match &result {
            Ok(()) => self.part_complete(true, false, None),
            Err(e) => self.part_complete(true, true, Some(e)),
        }
        result
    }

    pub async fn read_response_headers(&self) -> Result<ResponseHead> {
        let mut codec = self.codec.lock().await;
        let result = codec.read_response_headers().await;
        drop(codec);
        self.abort_on_error(&result);
        result
    }

    /// Open the response body; its EOF (or early close) completes this
    /// exchange.
    pub async fn open_response_body(this: &Arc<Self>, head: &ResponseHead) -> Result<Body> {
        let opened = {
            let mut codec = this.codec.lock().await;
            codec.open_response_body().await
        };
        this.abort_on_error(&opened);
        let (reader, content_length) = opened?;
        let content_type = header_str(&head.headers, "content-type").map(str::to_string);
        if content_length == 0 {
            // Nothing to stream; the receive half is already complete and
            // dropping the body cannot poison the connection.
            drop(reader);
            this.part_complete(false, true, None);
            return Ok(Body::from_bytes(bytes::Bytes::new(), content_type));
        }
        let reader = ExchangeBodyReader {
            inner: reader,
            exchange: Arc::clone(this),
            completed: false,
        };
        Ok(Body::from_reader(Box::new(reader), content_type, content_length))
    }

    /// A response without a body (HEAD, 204, 304) completes the receive
    /// half immediately.
    pub fn no_response_body(&self) {
        self.part_complete(false, true, None);
    }

    /// Abort this exchange: stream reset where the codec supports it,
    /// socket teardown otherwise.
    pub fn cancel(&self) {
        (self.canceller)();
        self.connection.cancel();
    }

    /// Record a failure that surfaced outside the codec read/write path
    /// and finish the exchange.
    pub fn note_failure(&self, error: &Error) {
        self.part_complete(true, true, Some(error));
    }

    /// A codec error means no more bytes will flow either way.
    fn abort_on_error<T>(&self, result: &Result<T>) {
        if let Err(e) = result {
            self.part_complete(true, true, Some(e));
        }
    }

    fn part_complete(&self, request: bool, response: bool, error: Option<&Error>) {
        let (finished, success) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if request {
                state.request_done = true;
            }
            if response {
                state.response_done = true;
            }
            if error.is_some() {
                state.failed = true;
            }
            let finished = state.request_done && state.response_done && !state.reported;
            if finished {
                state.reported = true;
            }
            (finished, !state.failed)
        };

        if let Some(error) = error {
            self.connection.track_failure(error);
            if let Some(call) = self.call.upgrade() {
                call.exchange_failed(error);
            }
        }
        if finished {
            if success {
                self.connection.record_success();
            }
            if let Some(call) = self.call.upgrade() {
                call.exchange_finished(success);
            }
        }
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("connection", &self.connection)
            .finish()
    }
}

/// Response body stream that completes its exchange at EOF and tears the
/// exchange down when dropped before EOF.
struct ExchangeBodyReader {
    inner: Box<dyn BodyReader>,
    exchange: Arc<Exchange>,
    completed: bool,
}

#[async_trait]
impl BodyReader for ExchangeBodyReader {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.completed {
            return Ok(0);
        }
        match self.inner.read(buf).await {
            Ok(0) => {
                self.completed = true;
                self.exchange.part_complete(false, true, None);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                self.completed = true;
                let error = Error::Io(io::Error::new(e.kind(), e.to_string()));
                self.exchange.part_complete(false, true, Some(&error));
                Err(e)
            }
        }
    }
}

impl Drop for ExchangeBodyReader {
    fn drop(&mut self) {
        if !self.completed {
            // The body was abandoned: the connection cannot be reused for
            // HTTP/1, and a multiplexed stream must be reset.
            self.exchange.cancel();
            self.exchange.connection.no_new_exchanges();
            let error = Error::io("response body was not fully consumed");
            self.exchange.part_complete(false, true, Some(&error));
        }
    }
}
