//! The wire-codec seam. Concrete HTTP/1 and HTTP/2 framing lives outside
//! this crate; the core drives codecs only through these traits.

use async_trait::async_trait;

use crate::body::BodyReader;
use crate::error::Result;
use crate::request::{Request, RequestBody};
use crate::response::ResponseHead;

use super::connection::RealConnection;

/// Reads and writes one request/response pair on a connection: one HTTP/1
/// request cycle, or one HTTP/2 stream.
#[async_trait]
pub trait ExchangeCodec: Send {
    async fn write_request_headers(&mut self, request: &Request) -> Result<()>;

    async fn write_request_body(&mut self, body: &RequestBody) -> Result<()>;

    /// Flush the request; no more request bytes will follow.
    async fn finish_request(&mut self) -> Result<()>;

    /// Read the next status line + headers. Interim (1xx) heads may be
    /// returned; the caller drains them.
    async fn read_response_headers(&mut self) -> Result<ResponseHead>;

    /// Open the response body stream. Returns the reader and the body
    /// length (`-1` when unknown).
    async fn open_response_body(&mut self) -> Result<(Box<dyn BodyReader>, i64)>;

    /// A handle that aborts this exchange from any task: RST_STREAM where
    /// the protocol has one, otherwise by wrecking the carrier socket.
    fn canceller(&self) -> Box<dyn Fn() + Send + Sync>;
}

/// Creates codecs for freshly established connections.
pub trait CodecFactory: Send + Sync {
    fn new_codec(&self, connection: &RealConnection) -> Result<Box<dyn ExchangeCodec>>;

    /// Streams one multiplexed connection can carry concurrently.
    fn allocation_limit(&self, connection: &RealConnection) -> usize {
        if connection.is_multiplexed() {
            // A conservative floor until SETTINGS says otherwise.
            4
        } else {
            1
        }
    }
}

/// Factory for clients that were built without a codec collaborator.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredCodecFactory;

impl CodecFactory for UnconfiguredCodecFactory {
    fn new_codec(&self, _connection: &RealConnection) -> Result<Box<dyn ExchangeCodec>> {
        Err(crate::error::Error::protocol(
            "no exchange codec configured for this client",
        ))
    }
}
