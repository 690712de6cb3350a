//! # kestrel
//!
//! An HTTP/1.1 and HTTP/2 client core: it issues requests, receives
//! responses, and manages the transport lifecycle underneath them.
//!
//! The heavy lifting happens in four subsystems:
//!
//! - a [`Dispatcher`](dispatcher::Dispatcher) that schedules asynchronous
//!   calls under global and per-host concurrency limits;
//! - an [`Interceptor`](interceptor::Interceptor) chain folding retries,
//!   redirects, the HTTP cache, header rewriting, and the transport into
//!   one composable pipeline;
//! - a [`ConnectionPool`](connect::ConnectionPool) with route selection,
//!   HTTP/2 coalescing, idle eviction, and leak detection;
//! - a [`CacheStrategy`](cache::CacheStrategy) engine implementing
//!   RFC 7234 freshness and validation.
//!
//! Wire codecs, TLS, DNS, cookies, proxy selection, and the on-disk cache
//! store are collaborators behind traits; defaults are provided where a
//! default makes sense.

pub mod auth;
pub mod body;
pub mod cache;
pub mod call;
pub mod client;
pub mod connect;
pub mod cookie;
pub mod dispatcher;
pub mod dns;
pub mod endpoint;
pub mod error;
pub mod headers;
pub mod interceptor;
pub mod pinning;
pub mod protocol;
pub mod proxy;
pub mod request;
pub mod response;
pub mod route;
pub mod tls;
pub mod transport;

pub use body::Body;
pub use cache::{Cache, CacheControl, CacheStrategy};
pub use call::{Call, Callback};
pub use client::{HttpClient, HttpClientBuilder};
pub use connect::{ConnectionPool, ExchangeCodec};
pub use dispatcher::Dispatcher;
pub use error::{Error, Result, TimeoutKind};
pub use pinning::CertificatePinner;
pub use protocol::Protocol;
pub use request::{Request, RequestBody};
pub use response::{Response, ResponseHead};
