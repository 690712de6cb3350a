//! Chooses or creates a healthy connection for one request attempt.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use url::Url;

use crate::call::RealCall;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::route::{Route, RouteDatabase, RouteSelector, Selection};

use super::codec::CodecFactory;
use super::connection::RealConnection;
use super::pool::ConnectionPool;

struct FinderState {
    route_selector: Option<RouteSelector>,
    selection: Option<Selection>,
    next_route_to_try: Option<Route>,
    first_connect_error: Option<Arc<Error>>,
    refused_stream_count: u32,
    connection_shutdown_count: u32,
    other_failure_count: u32,
}

/// Finds connections for one call's attempts against one endpoint.
///
/// Connection sources, in order: the connection already attached to the
/// call, the pool, a route hint from a previous attempt, a fresh route
/// (with a coalescing re-query of the pool), and finally a brand-new
/// handshake which races the pool once more before being kept.
pub struct ExchangeFinder {
    pool: ConnectionPool,
    endpoint: Endpoint,
    url: Url,
    call: Arc<RealCall>,
    route_database: Arc<RouteDatabase>,
    codec_factory: Arc<dyn CodecFactory>,
    connect_timeout: Duration,
    state: Mutex<FinderState>,
}

impl ExchangeFinder {
    pub(crate) fn new(
        pool: ConnectionPool,
        endpoint: Endpoint,
        url: Url,
        call: Arc<RealCall>,
        route_database: Arc<RouteDatabase>,
        codec_factory: Arc<dyn CodecFactory>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            endpoint,
            url,
            call,
            route_database,
            codec_factory,
            connect_timeout,
            state: Mutex::new(FinderState {
                route_selector: None,
                selection: None,
                next_route_to_try: None,
                first_connect_error: None,
                refused_stream_count: 0,
                connection_shutdown_count: 0,
                other_failure_count: 0,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, FinderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Find a healthy connection, discarding sick candidates as found.
    pub async fn find(&self, do_extensive_checks: bool) -> Result<Arc<RealConnection>> {
        loop {
            let connection = match self.find_connection().await {
                Ok(connection) => connection,
                Err(e) => {
                    // Failed attempts feed retry_after_failure.
                    if !e.is_canceled() {
                        self.track_failure(&e);
                    }
                    return Err(e);
                }
            };
            if !connection.is_healthy(do_extensive_checks) {
                connection.no_new_exchanges();
                self.call.release_connection_if_unused();
                continue;
            }
            return Ok(connection);
        }
    }

    async fn find_connection(&self) -> Result<Arc<RealConnection>> {
        if self.call.is_canceled() {
            return Err(Error::Canceled);
        }

        // 1. The connection already attached to this call, left over from
        // a previous attempt or follow-up.
        if let Some(connection) = self.call.connection() {
            if !connection.is_no_new_exchanges() && connection.supports_url(&self.url) {
                return Ok(connection);
            }
            self.call.release_connection_if_unused();
        }

        // 2. A pooled connection keyed by endpoint alone.
        if let Some(connection) =
            self.pool
                .call_acquire_pooled_connection(&self.endpoint, &self.call, None, false)
        {
            self.call.set_connection(&connection);
            return Ok(connection);
        }

        // 3. A route verified by a previous attempt, or 4. the next fresh
        // route from the selector.
        let route = match self.next_route().await? {
            RouteOrPooled::Route(route) => route,
            RouteOrPooled::Pooled(connection) => return Ok(connection),
        };

        // 5. A brand-new connection over the selected route.
        let connected = RealConnection::connect(
            route.clone(),
            Arc::clone(&self.codec_factory),
            self.connect_timeout,
        )
        .await;
        let connection = match connected {
            Ok(connection) => connection,
            Err(e) => {
                {
                    let state = self.lock_state();
                    if let Some(selector) = &state.route_selector {
                        selector.connect_failed(&route);
                    }
                }
                self.route_database.failed(&route);
                let last = Arc::new(e);
                let first = {
                    let mut state = self.lock_state();
                    state
                        .first_connect_error
                        .get_or_insert_with(|| Arc::clone(&last))
                        .clone()
                };
                return Err(Error::RouteFailure { first, last });
            }
        };
        self.route_database.connected(&route);

        // 6. Concurrent attempts to the same host may have pooled a
        // multiplexed connection while we shook hands; prefer theirs.
        if connection.is_multiplexed() {
            if let Some(pooled) = self.pool.call_acquire_pooled_connection(
                &self.endpoint,
                &self.call,
                Some(std::slice::from_ref(&route)),
                true,
            ) {
                tracing::debug!(
                    winner = pooled.id(),
                    loser = connection.id(),
                    "lost the connection race; discarding fresh connection"
                );
                connection.cancel();
                self.lock_state().next_route_to_try = Some(route);
                self.call.set_connection(&pooled);
                return Ok(pooled);
            }
        }

        connection.attach_call(&self.call);
        self.pool.put(Arc::clone(&connection));
        self.call.set_connection(&connection);
        Ok(connection)
    }

    /// Produce the next candidate route. Resolving a fresh selection may
    /// instead surface a pooled connection via coalescing.
    async fn next_route(&self) -> Result<RouteOrPooled> {
        loop {
            {
                let mut state = self.lock_state();
                if let Some(route) = state.next_route_to_try.take() {
                    return Ok(RouteOrPooled::Route(route));
                }
                if let Some(selection) = &mut state.selection {
                    if let Some(route) = selection.next() {
                        return Ok(RouteOrPooled::Route(route));
                    }
                }
            }

            // Take the selector out while resolving so the DNS await does
            // not happen under the lock.
            let mut selector = match self.lock_state().route_selector.take() {
                Some(selector) => selector,
                None => RouteSelector::new(self.endpoint.clone(), Arc::clone(&self.route_database)),
            };
            let resolved = selector.next().await;
            let selection = {
                let mut state = self.lock_state();
                state.route_selector = Some(selector);
                resolved?
            };
            if self.call.is_canceled() {
                return Err(Error::Canceled);
            }

            // Fresh addresses may coalesce onto an existing HTTP/2
            // connection for another hostname.
            if let Some(connection) = self.pool.call_acquire_pooled_connection(
                &self.endpoint,
                &self.call,
                Some(selection.routes()),
                false,
            ) {
                self.call.set_connection(&connection);
                return Ok(RouteOrPooled::Pooled(connection));
            }
            self.lock_state().selection = Some(selection);
        }
    }

    /// Update failure counters from a failed exchange.
    pub fn track_failure(&self, error: &Error) {
        let mut state = self.lock_state();
        match error.root() {
            Error::RefusedStream => state.refused_stream_count += 1,
            Error::Shutdown => state.connection_shutdown_count += 1,
            _ => state.other_failure_count += 1,
        }
    }

    /// Whether a retry may find a different outcome: another route, the
    /// same just-verified route, or an unexplored selection.
    pub fn retry_after_failure(&self) -> bool {
        let mut state = self.lock_state();
        if state.refused_stream_count == 0
            && state.connection_shutdown_count == 0
            && state.other_failure_count == 0
        {
            return false;
        }
        if state.next_route_to_try.is_some() {
            return true;
        }
        if let Some(route) = self.retry_route(&state) {
            state.next_route_to_try = Some(route);
            return true;
        }
        if state.selection.as_ref().is_some_and(Selection::has_next) {
            return true;
        }
        match &state.route_selector {
            // Not yet initialized: assumed to have at least one route.
            None => true,
            Some(selector) => selector.has_next(),
        }
    }

    /// The current connection's route, when it is still worth one retry.
    fn retry_route(&self, state: &FinderState) -> Option<Route> {
        if state.refused_stream_count > 1
            || state.connection_shutdown_count > 1
            || state.other_failure_count > 0
        {
            return None;
        }
        let connection = self.call.connection()?;
        if connection.route_failure_count() != 0 {
            return None;
        }
        if !connection.supports_url(&self.url) {
            return None;
        }
        Some(connection.route().clone())
    }
}

enum RouteOrPooled {
    Route(Route),
    Pooled(Arc<RealConnection>),
}
