//! Error types for the kestrel crate.

use std::io;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Which deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// TCP + TLS handshake deadline.
    Connect,
    /// Socket read deadline.
    Read,
    /// Socket write deadline.
    Write,
    /// Whole-call deadline, covering retries and follow-ups.
    Call,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connect => "connect",
            Self::Read => "read",
            Self::Write => "write",
            Self::Call => "call",
        };
        f.write_str(s)
    }
}

/// Errors that can occur during HTTP operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The call was cancelled before or during an attempt.
    #[error("canceled")]
    Canceled,

    /// Malformed framing or a disallowed protocol state transition.
    #[error("HTTP protocol error: {0}")]
    Protocol(String),

    /// Every candidate route for one connect attempt failed. Carries the
    /// first and the most recent inner failure.
    #[error("exhausted all routes: {last}")]
    RouteFailure {
        first: std::sync::Arc<Error>,
        last: std::sync::Arc<Error>,
    },

    /// A socket-level or call-level deadline expired.
    #[error("{kind} timed out")]
    Timeout { kind: TimeoutKind },

    /// DNS resolution failure.
    #[error("failed to resolve {host}: {message}")]
    Dns { host: String, message: String },

    /// TLS handshake or configuration failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// TLS handshake failed because certificate validation rejected the
    /// peer chain.
    #[error("TLS certificate rejected: {0}")]
    TlsCertificate(String),

    /// Certificate pinner rejected the peer chain.
    #[error("certificate pinning failure:{0}")]
    TlsPinning(String),

    /// The peer's identity could not be verified against the hostname.
    #[error("hostname {host} not verified by peer certificate")]
    PeerUnverified { host: String },

    /// Peer shut the connection down gracefully while a request was in
    /// flight. Retryable as if the request had not started.
    #[error("connection shut down by peer")]
    Shutdown,

    /// HTTP/2 stream refused by the peer (REFUSED_STREAM).
    #[error("stream refused by peer")]
    RefusedStream,

    /// Redirect/auth follow-up chain exceeded the hard bound.
    #[error("too many follow-up requests: {0}")]
    TooManyFollowUps(u32),

    /// A 204/205 response carried a non-empty body.
    #[error("HTTP {status} had non-zero Content-Length: {content_length}")]
    UnexpectedResponseBody { status: u16, content_length: i64 },

    /// URL parsing error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// The request URL is not something this client can speak.
    #[error("unsupported URL: {0}")]
    UnsupportedUrl(String),

    /// JSON deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Cache store failure.
    #[error("cache error: {0}")]
    Cache(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A surfaced error together with the recoverable errors that were
    /// consumed by the retry loop before it.
    #[error("{error}")]
    WithSuppressed {
        error: Box<Error>,
        suppressed: Vec<Error>,
    },
}

impl Error {
    /// Create an HTTP protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls(message.into())
    }

    pub fn timeout(kind: TimeoutKind) -> Self {
        Self::Timeout { kind }
    }

    /// Create an IO error with a custom message.
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(io::Error::other(message.into()))
    }

    /// Attach suppressed errors; a no-op when the list is empty.
    pub fn with_suppressed(self, suppressed: Vec<Error>) -> Self {
        if suppressed.is_empty() {
            self
        } else {
            Self::WithSuppressed {
                error: Box::new(self),
                suppressed,
            }
        }
    }

    /// The surfaced error, unwrapping any suppressed-list wrapper.
    pub fn root(&self) -> &Error {
        match self {
            Self::WithSuppressed { error, .. } => error.root(),
            other => other,
        }
    }

    /// True when this failure happened while establishing a route, before
    /// any request bytes could have been written.
    pub fn is_route_failure(&self) -> bool {
        matches!(self.root(), Self::RouteFailure { .. })
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self.root(), Self::Canceled)
    }

    /// Whether the retry loop may attempt another route after this failure.
    ///
    /// Protocol violations mean the server spoke and we disagree about
    /// semantics; a different route will not help. Certificate rejections
    /// and unverified peers are identity failures, not transport flakes.
    /// Timeouts retry only when they fired at connect time.
    pub fn is_recoverable(&self, request_send_started: bool) -> bool {
        match self.root() {
            Self::Protocol(_) | Self::UnexpectedResponseBody { .. } => false,
            Self::Timeout { kind } => {
                matches!(kind, TimeoutKind::Connect) && !request_send_started
            }
            Self::TlsCertificate(_) | Self::TlsPinning(_) => false,
            Self::PeerUnverified { .. } => false,
            Self::Canceled => false,
            Self::TooManyFollowUps(_) => false,
            Self::RouteFailure { last, .. } => last.is_recoverable(false),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_timeout_is_recoverable_before_send() {
        let e = Error::timeout(TimeoutKind::Connect);
        assert!(e.is_recoverable(false));
        assert!(!e.is_recoverable(true));
    }

    #[test]
    fn read_timeout_is_not_recoverable() {
        let e = Error::timeout(TimeoutKind::Read);
        assert!(!e.is_recoverable(false));
    }

    #[test]
    fn certificate_failures_are_fatal() {
        assert!(!Error::TlsCertificate("bad chain".into()).is_recoverable(false));
        assert!(!Error::TlsPinning("pin mismatch".into()).is_recoverable(false));
        assert!(!Error::PeerUnverified { host: "h".into() }.is_recoverable(false));
    }

    #[test]
    fn suppressed_wrapper_delegates_classification() {
        let e = Error::Shutdown.with_suppressed(vec![Error::Canceled]);
        assert!(e.is_recoverable(false));
        assert!(matches!(e.root(), Error::Shutdown));
    }

    #[test]
    fn empty_suppressed_list_is_identity() {
        let e = Error::Canceled.with_suppressed(vec![]);
        assert!(matches!(e, Error::Canceled));
    }
}
