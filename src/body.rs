//! Response body plumbing: an async byte source with buffering helpers
//! and the transparent gzip wrapper.

use std::io::{self, Cursor, Read};

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::MultiGzDecoder;

use crate::error::{Error, Result};

/// An async source of body bytes. `read` returning 0 means end of body.
#[async_trait]
pub trait BodyReader: Send + Sync {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

enum BodySource {
    Empty,
    Buffered(Cursor<Bytes>),
    Reader(Box<dyn BodyReader>),
}

/// A response body: possibly streamed from a live exchange, possibly
/// buffered in memory, possibly absent.
pub struct Body {
    source: BodySource,
    content_type: Option<String>,
    content_length: i64,
}

impl Body {
    pub fn empty() -> Self {
        Self {
            source: BodySource::Empty,
            content_type: None,
            content_length: 0,
        }
    }

    pub fn from_bytes(bytes: impl Into<Bytes>, content_type: Option<String>) -> Self {
        let bytes = bytes.into();
        let content_length = bytes.len() as i64;
        Self {
            source: BodySource::Buffered(Cursor::new(bytes)),
            content_type,
            content_length,
        }
    }

    /// A streamed body. `content_length` is `-1` when unknown.
    pub fn from_reader(
        reader: Box<dyn BodyReader>,
        content_type: Option<String>,
        content_length: i64,
    ) -> Self {
        Self {
            source: BodySource::Reader(reader),
            content_type,
            content_length,
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Declared length in bytes, `-1` when unknown.
    pub fn content_length(&self) -> i64 {
        self.content_length
    }

    /// Read the next chunk of body bytes into `buf`.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.source {
            BodySource::Empty => Ok(0),
            BodySource::Buffered(cursor) => cursor.read(buf),
            BodySource::Reader(reader) => reader.read(buf).await,
        }
    }

    /// Drain the body into memory.
    pub async fn bytes(mut self) -> Result<Bytes> {
        match self.source {
            BodySource::Empty => Ok(Bytes::new()),
            BodySource::Buffered(cursor) => {
                let pos = cursor.position() as usize;
                Ok(cursor.into_inner().slice(pos..))
            }
            BodySource::Reader(_) => {
                let mut out = Vec::new();
                let mut chunk = [0u8; 8 * 1024];
                loop {
                    let n = self.read(&mut chunk).await?;
                    if n == 0 {
                        break;
                    }
                    out.extend_from_slice(&chunk[..n]);
                }
                Ok(Bytes::from(out))
            }
        }
    }

    /// Unwrap into the underlying reader, for wrapping in a decoder or tee.
    pub fn into_reader(self) -> Box<dyn BodyReader> {
        match self.source {
            BodySource::Empty => Box::new(EmptyReader),
            BodySource::Buffered(cursor) => {
                let pos = cursor.position() as usize;
                Box::new(BytesReader::new(cursor.into_inner().slice(pos..)))
            }
            BodySource::Reader(reader) => reader,
        }
    }

    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::protocol(format!("body is not UTF-8: {e}")))
    }

    pub async fn json<T: serde::de::DeserializeOwned>(self) -> Result<T> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(Error::from)
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.source {
            BodySource::Empty => "empty",
            BodySource::Buffered(_) => "buffered",
            BodySource::Reader(_) => "streamed",
        };
        f.debug_struct("Body")
            .field("kind", &kind)
            .field("content_length", &self.content_length)
            .finish()
    }
}

enum GzipState {
    /// Compressed bytes still arriving from the wire.
    Filling {
        inner: Box<dyn BodyReader>,
        compressed: Vec<u8>,
    },
    /// Everything received; serving decompressed bytes.
    Draining(MultiGzDecoder<Cursor<Vec<u8>>>),
}

/// Decodes a gzip-encoded body.
///
/// The compressed stream is drained to completion on first read, then
/// inflated incrementally from memory.
pub struct GzipReader {
    state: Option<GzipState>,
}

impl GzipReader {
    pub fn new(inner: Box<dyn BodyReader>) -> Self {
        Self {
            state: Some(GzipState::Filling {
                inner,
                compressed: Vec::new(),
            }),
        }
    }
}

#[async_trait]
impl BodyReader for GzipReader {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.state.take() {
                Some(GzipState::Filling {
                    mut inner,
                    mut compressed,
                }) => {
                    let mut chunk = [0u8; 8 * 1024];
                    loop {
                        let n = inner.read(&mut chunk).await?;
                        if n == 0 {
                            break;
                        }
                        compressed.extend_from_slice(&chunk[..n]);
                    }
                    self.state = Some(GzipState::Draining(MultiGzDecoder::new(Cursor::new(
                        compressed,
                    ))));
                }
                Some(GzipState::Draining(mut decoder)) => {
                    let n = decoder.read(buf)?;
                    self.state = Some(GzipState::Draining(decoder));
                    return Ok(n);
                }
                None => return Ok(0),
            }
        }
    }
}

/// Reader with nothing to read.
pub struct EmptyReader;

#[async_trait]
impl BodyReader for EmptyReader {
    async fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }
}

/// Adapter exposing fully-buffered bytes through the reader trait.
pub struct BytesReader(Cursor<Bytes>);

impl BytesReader {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(Cursor::new(bytes.into()))
    }
}

#[async_trait]
impl BodyReader for BytesReader {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn buffered_body_round_trip() {
        let body = Body::from_bytes(&b"hello"[..], Some("text/plain".into()));
        assert_eq!(body.content_length(), 5);
        assert_eq!(body.bytes().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn empty_body_reads_zero() {
        let mut body = Body::empty();
        let mut buf = [0u8; 4];
        assert_eq!(body.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn gzip_reader_inflates() {
        let compressed = gzip(b"the quick brown fox");
        let reader = GzipReader::new(Box::new(BytesReader::new(compressed)));
        let body = Body::from_reader(Box::new(reader), None, -1);
        assert_eq!(body.bytes().await.unwrap().as_ref(), b"the quick brown fox");
    }

    #[tokio::test]
    async fn streamed_body_drains_in_chunks() {
        let data: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
        let body = Body::from_reader(Box::new(BytesReader::new(data.clone())), None, -1);
        assert_eq!(body.bytes().await.unwrap().as_ref(), &data[..]);
    }
}
