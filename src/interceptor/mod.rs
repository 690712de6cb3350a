//! The interceptor chain: a uniform pipeline that carries every request
//! from the application to the wire and every response back.

mod bridge;
mod cache;
mod call_server;
mod connect;
mod retry;

pub use bridge::BridgeInterceptor;
pub use cache::CacheInterceptor;
pub use call_server::CallServerInterceptor;
pub use connect::ConnectInterceptor;
pub use retry::RetryAndFollowUpInterceptor;

use std::sync::Arc;

use async_trait::async_trait;

use crate::call::RealCall;
use crate::connect::Exchange;
use crate::error::Result;
use crate::request::Request;
use crate::response::Response;

/// Observes, rewrites, retries, or short-circuits one request/response
/// round trip. Application interceptors sit before the retry loop;
/// network interceptors sit between the cache and the wire.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(&self, chain: &mut Chain) -> Result<Response>;
}

/// One position in the interceptor pipeline.
///
/// Calling [`Chain::proceed`] hands the request to the next interceptor
/// and returns its response. Once an exchange is attached (at and after
/// the connect position), each node must proceed exactly once, and may
/// not move the request to a different host or port.
pub struct Chain {
    interceptors: Arc<[Arc<dyn Interceptor>]>,
    index: usize,
    call: Arc<RealCall>,
    exchange: Option<Arc<Exchange>>,
    request: Request,
    calls: u32,
}

impl Chain {
    pub(crate) fn new(
        interceptors: Arc<[Arc<dyn Interceptor>]>,
        call: Arc<RealCall>,
        request: Request,
    ) -> Self {
        Self {
            interceptors,
            index: 0,
            call,
            exchange: None,
            request,
            calls: 0,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn call(&self) -> &Arc<RealCall> {
        &self.call
    }

    pub fn exchange(&self) -> Option<&Arc<Exchange>> {
        self.exchange.as_ref()
    }

    pub(crate) fn set_exchange(&mut self, exchange: Arc<Exchange>) {
        self.exchange = Some(exchange);
    }

    /// Invoke the rest of the chain on `request`.
    pub async fn proceed(&mut self, request: Request) -> Result<Response> {
        assert!(
            self.index < self.interceptors.len(),
            "chain ran past the last interceptor"
        );
        self.calls += 1;

        if let Some(exchange) = &self.exchange {
            assert!(
                exchange.connection().supports_url(request.url()),
                "network interceptor {} must retain the same host and port",
                self.index.saturating_sub(1),
            );
            assert!(
                self.calls == 1,
                "network interceptor {} must call proceed() exactly once",
                self.index.saturating_sub(1),
            );
        }

        let mut next = Chain {
            interceptors: Arc::clone(&self.interceptors),
            index: self.index + 1,
            call: Arc::clone(&self.call),
            exchange: self.exchange.clone(),
            request: request.clone(),
            calls: 0,
        };
        let interceptor = Arc::clone(&self.interceptors[self.index]);
        let response = interceptor.intercept(&mut next).await?;

        // A post-connect interceptor that swallowed or duplicated the
        // network round trip produced an unusable response.
        if next.exchange.is_some() && next.index < self.interceptors.len() {
            assert!(
                next.calls == 1,
                "network interceptor {} must call proceed() exactly once",
                self.index,
            );
        }
        Ok(response)
    }
}
