//! Call lifecycle: per-request state, cancellation, deadlines, and
//! resource release.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use http::Method;

use crate::client::ClientCore;
use crate::connect::{Exchange, ExchangeFinder};
use crate::error::{Error, Result, TimeoutKind};
use crate::interceptor::{
    BridgeInterceptor, CacheInterceptor, CallServerInterceptor, Chain, ConnectInterceptor,
    Interceptor, RetryAndFollowUpInterceptor,
};
use crate::request::Request;
use crate::response::Response;

/// Receives the terminal outcome of an asynchronous call. Exactly one of
/// these fires per call, on the dispatcher worker that drove it.
pub trait Callback: Send + Sync {
    fn on_response(&self, call: &Call, response: Response);
    fn on_failure(&self, call: &Call, error: Error);
}

struct CallState {
    finder: Option<Arc<ExchangeFinder>>,
    connection: Option<Arc<crate::connect::RealConnection>>,
    exchange: Option<Arc<Exchange>>,
    /// The most recent exchange, kept for the retry interceptor's
    /// follow-up decisions (421 coalescing checks) after completion.
    interceptor_scoped_exchange: Option<Arc<Exchange>>,
    no_more_exchanges: bool,
}

/// A request prepared for execution. Obtain one from
/// [`HttpClient::new_call`](crate::client::HttpClient::new_call), then
/// either [`execute`](Call::execute) it on this task or
/// [`enqueue`](Call::enqueue) it on the dispatcher.
pub struct Call {
    inner: Arc<RealCall>,
}

impl Call {
    pub(crate) fn new(client: Arc<ClientCore>, request: Request) -> Self {
        Self {
            inner: Arc::new(RealCall {
                client,
                request,
                canceled: AtomicBool::new(false),
                executed: AtomicBool::new(false),
                state: Mutex::new(CallState {
                    finder: None,
                    connection: None,
                    exchange: None,
                    interceptor_scoped_exchange: None,
                    no_more_exchanges: false,
                }),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<RealCall>) -> Self {
        Self { inner }
    }

    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    /// Run the call on the current task and await its response.
    pub async fn execute(&self) -> Result<Response> {
        self.inner.mark_executed()?;
        self.inner.client.dispatcher.executed(&self.inner);
        let result = RealCall::run(&self.inner).await;
        self.inner.client.dispatcher.finished_sync(&self.inner);
        result
    }

    /// Hand the call to the dispatcher; `callback` fires exactly once.
    pub fn enqueue(&self, callback: Arc<dyn Callback>) -> Result<()> {
        self.inner.mark_executed()?;
        self.inner
            .client
            .dispatcher
            .enqueue(Arc::clone(&self.inner), callback);
        Ok(())
    }

    /// Cancel the call. Idempotent; safe from any task.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.is_canceled()
    }

    pub fn is_executed(&self) -> bool {
        self.inner.executed.load(Ordering::Acquire)
    }
}

/// The shared state behind a [`Call`]. Connections hold weak references
/// to this so leak detection can name the request that leaked.
pub struct RealCall {
    client: Arc<ClientCore>,
    request: Request,
    canceled: AtomicBool,
    executed: AtomicBool,
    state: Mutex<CallState>,
}

impl RealCall {
    pub(crate) fn client(&self) -> &Arc<ClientCore> {
        &self.client
    }

    pub(crate) fn request(&self) -> &Request {
        &self.request
    }

    /// "METHOD url" for diagnostics and leak attribution.
    pub(crate) fn request_line(&self) -> String {
        format!("{} {}", self.request.method(), self.request.url())
    }

    fn lock_state(&self) -> MutexGuard<'_, CallState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mark_executed(&self) -> Result<()> {
        if self.executed.swap(true, Ordering::AcqRel) {
            return Err(Error::protocol("call already executed"));
        }
        Ok(())
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Flag the call as cancelled and tear down whatever is in flight.
    pub fn cancel(&self) {
        if self.canceled.swap(true, Ordering::AcqRel) {
            return;
        }
        let (exchange, connection) = {
            let state = self.lock_state();
            (state.exchange.clone(), state.connection.clone())
        };
        if let Some(exchange) = exchange {
            exchange.cancel();
        } else if let Some(connection) = connection {
            // Covers an in-progress connect attempt.
            connection.cancel();
        }
        tracing::debug!(request = %self.request_line(), "call canceled");
    }

    /// Drive the interceptor chain, honoring the per-call deadline.
    pub(crate) async fn run(this: &Arc<Self>) -> Result<Response> {
        match this.client.call_timeout {
            Some(deadline) => {
                match tokio::time::timeout(deadline, Self::response_with_interceptor_chain(this))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        this.cancel();
                        this.no_more_exchanges();
                        Err(Error::timeout(TimeoutKind::Call))
                    }
                }
            }
            None => Self::response_with_interceptor_chain(this).await,
        }
    }

    async fn response_with_interceptor_chain(this: &Arc<Self>) -> Result<Response> {
        let mut interceptors: Vec<Arc<dyn Interceptor>> = Vec::with_capacity(
            this.client.interceptors.len() + this.client.network_interceptors.len() + 5,
        );
        interceptors.extend(this.client.interceptors.iter().cloned());
        interceptors.push(Arc::new(RetryAndFollowUpInterceptor));
        interceptors.push(Arc::new(BridgeInterceptor));
        interceptors.push(Arc::new(CacheInterceptor));
        interceptors.push(Arc::new(ConnectInterceptor));
        interceptors.extend(this.client.network_interceptors.iter().cloned());
        interceptors.push(Arc::new(CallServerInterceptor));

        let mut chain = Chain::new(interceptors.into(), Arc::clone(this), this.request.clone());
        let result = chain.proceed(this.request.clone()).await;
        let result = match result {
            Ok(response) if this.is_canceled() => {
                // The response body's drop handler tears the exchange down.
                drop(response);
                Err(Error::Canceled)
            }
            other => other,
        };
        this.no_more_exchanges();
        result
    }

    /// Start a new attempt. The first attempt (and any follow-up that
    /// moved host) builds a fresh exchange finder.
    pub(crate) fn enter_network_interceptor_exchange(
        this: &Arc<Self>,
        request: &Request,
        new_exchange_finder: bool,
    ) -> Result<()> {
        if new_exchange_finder {
            let endpoint = this.client.endpoint_for(request.url())?;
            let finder = ExchangeFinder::new(
                this.client.pool.clone(),
                endpoint,
                request.url().clone(),
                Arc::clone(this),
                Arc::clone(&this.client.route_database),
                Arc::clone(&this.client.codec_factory),
                this.client.connect_timeout,
            );
            this.lock_state().finder = Some(Arc::new(finder));
        }
        Ok(())
    }

    /// Acquire a healthy connection and open an exchange on it.
    pub(crate) async fn init_exchange(
        this: &Arc<Self>,
        request: &Request,
    ) -> Result<Arc<Exchange>> {
        if this.is_canceled() {
            return Err(Error::Canceled);
        }
        let finder = {
            let state = this.lock_state();
            if state.no_more_exchanges {
                return Err(Error::io("call is done making exchanges"));
            }
            if state.exchange.is_some() {
                return Err(Error::protocol("an exchange is already in flight"));
            }
            state
                .finder
                .clone()
                .ok_or_else(|| Error::protocol("connect reached before retry interceptor"))?
        };

        // A follow-up whose target the current finder cannot serve (the
        // redirect changed host) needs a fresh finder.
        if !finder.endpoint().supports_url(request.url()) {
            Self::enter_network_interceptor_exchange(this, request, true)?;
            return Box::pin(Self::init_exchange(this, request)).await;
        }

        let do_extensive_checks = request.method() != Method::GET;
        let connection = finder.find(do_extensive_checks).await?;
        let codec = connection.new_codec()?;
        let exchange = Exchange::new(this, connection, codec);
        {
            let mut state = this.lock_state();
            state.exchange = Some(Arc::clone(&exchange));
            state.interceptor_scoped_exchange = Some(Arc::clone(&exchange));
        }
        Ok(exchange)
    }

    pub(crate) fn connection(&self) -> Option<Arc<crate::connect::RealConnection>> {
        self.lock_state().connection.clone()
    }

    pub(crate) fn set_connection(&self, connection: &Arc<crate::connect::RealConnection>) {
        self.lock_state().connection = Some(Arc::clone(connection));
    }

    pub(crate) fn interceptor_scoped_exchange(&self) -> Option<Arc<Exchange>> {
        self.lock_state().interceptor_scoped_exchange.clone()
    }

    /// Detach from the current connection, returning it to the pool or
    /// closing it if the pool declines.
    pub(crate) fn release_connection_if_unused(&self) {
        let connection = self.lock_state().connection.take();
        let Some(connection) = connection else { return };
        let became_idle = connection.remove_call(self);
        if became_idle && !self.client.pool.connection_became_idle(&connection) {
            drop(connection.take_transport());
        }
    }

    /// A codec operation failed; feed the failure counters.
    pub(crate) fn exchange_failed(&self, error: &Error) {
        let finder = self.lock_state().finder.clone();
        if let Some(finder) = finder {
            finder.track_failure(error);
        }
    }

    /// The in-flight exchange finished both halves.
    pub(crate) fn exchange_finished(&self, success: bool) {
        let release = {
            let mut state = self.lock_state();
            state.exchange = None;
            state.no_more_exchanges
        };
        if !success {
            // If the failure poisoned the connection, let go of it so the
            // next attempt finds a fresh one.
            let poisoned = self
                .connection()
                .is_some_and(|connection| connection.is_no_new_exchanges());
            if poisoned {
                self.release_connection_if_unused();
                return;
            }
        }
        if release {
            self.release_connection_if_unused();
        }
    }

    /// Whether the exchange finder thinks another route is worth trying.
    pub(crate) fn retry_after_failure(&self) -> bool {
        let finder = self.lock_state().finder.clone();
        finder.is_some_and(|finder| finder.retry_after_failure())
    }

    /// No further exchanges will be created; release what is releasable.
    pub(crate) fn no_more_exchanges(&self) {
        let release = {
            let mut state = self.lock_state();
            state.no_more_exchanges = true;
            state.exchange.is_none()
        };
        if release {
            self.release_connection_if_unused();
        }
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("request", &self.inner.request_line())
            .field("executed", &self.is_executed())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}
