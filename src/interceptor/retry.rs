//! Retries failed attempts and follows redirects, auth challenges, and
//! retryable status codes.

use async_trait::async_trait;
use http::Method;
use url::Url;

use crate::error::{Error, Result};
use crate::headers::parse_seconds;
use crate::request::{permits_request_body, redirects_with_body, Request};
use crate::response::Response;

use super::{Chain, Interceptor};

/// Hard bound on consecutive follow-ups. Chrome follows 21 redirects;
/// Firefox, curl and wget follow 20; Safari 16; RFC 2068 recommended 5.
const MAX_FOLLOW_UPS: u32 = 20;

/// Wraps a recovery-and-follow-up loop around the rest of the chain.
pub struct RetryAndFollowUpInterceptor;

#[async_trait]
impl Interceptor for RetryAndFollowUpInterceptor {
    async fn intercept(&self, chain: &mut Chain) -> Result<Response> {
        let call = chain.call().clone();
        let mut request = chain.request().clone();
        let mut new_exchange_finder = true;
        let mut recovered_errors: Vec<Error> = Vec::new();
        let mut prior_response: Option<Response> = None;
        let mut follow_up_count: u32 = 0;

        loop {
            if call.is_canceled() {
                return Err(Error::Canceled.with_suppressed(recovered_errors));
            }
            crate::call::RealCall::enter_network_interceptor_exchange(
                &call,
                &request,
                new_exchange_finder,
            )?;
            new_exchange_finder = false;

            let mut response = match chain.proceed(request.clone()).await {
                Ok(response) => response,
                Err(e) => {
                    // Connect-phase failures never wrote request bytes; a
                    // graceful shutdown means our bytes went nowhere.
                    let request_send_started =
                        !e.is_route_failure() && !matches!(e.root(), Error::Shutdown);
                    if !recover(&e, &call, request_send_started, &request) {
                        return Err(e.with_suppressed(recovered_errors));
                    }
                    tracing::debug!(error = %e, url = %request.url(), "recovering; will retry");
                    recovered_errors.push(e);
                    continue;
                }
            };
            if call.is_canceled() {
                return Err(Error::Canceled.with_suppressed(recovered_errors));
            }

            response.set_prior_response(prior_response.take());

            let Some(follow_up) = follow_up_request(&response, &call).await? else {
                return Ok(response);
            };
            if follow_up
                .body()
                .is_some_and(crate::request::RequestBody::is_one_shot)
            {
                // The body cannot be written again; surface what we have.
                return Ok(response);
            }

            follow_up_count += 1;
            if follow_up_count > MAX_FOLLOW_UPS {
                return Err(Error::TooManyFollowUps(follow_up_count)
                    .with_suppressed(recovered_errors));
            }

            tracing::debug!(
                status = response.status(),
                next = %follow_up.url(),
                "following up"
            );
            // Dropping the body now: an unconsumed streamed body poisons
            // its connection before the follow-up goes looking for one.
            prior_response = Some(response.strip_body());
            request = follow_up;
            new_exchange_finder = true;
        }
    }
}

/// Whether the failed attempt may be retried on another route.
fn recover(
    error: &Error,
    call: &crate::call::RealCall,
    request_send_started: bool,
    request: &Request,
) -> bool {
    if !call.client().retry_on_connection_failure {
        return false;
    }
    if request_send_started
        && request
            .body()
            .is_some_and(crate::request::RequestBody::is_one_shot)
    {
        return false;
    }
    if !error.is_recoverable(request_send_started) {
        return false;
    }
    call.retry_after_failure()
}

/// Decide the follow-up for `response`, or None to hand it to the caller.
async fn follow_up_request(
    response: &Response,
    call: &crate::call::RealCall,
) -> Result<Option<Request>> {
    let client = call.client();
    let route = call.connection().map(|c| c.route().clone());
    match response.status() {
        407 => {
            let proxy_is_direct = route
                .as_ref()
                .map_or(true, |r| r.proxy.is_direct());
            if proxy_is_direct {
                return Err(Error::protocol(
                    "received 407 from a server while not using a proxy",
                ));
            }
            client
                .proxy_authenticator
                .authenticate(route.as_ref(), response)
                .await
        }
        401 => {
            client
                .authenticator
                .authenticate(route.as_ref(), response)
                .await
        }
        307 | 308 => {
            // Temporary/permanent redirects preserve the method, so only
            // safe methods follow automatically.
            if !matches!(response.request().method(), &Method::GET | &Method::HEAD) {
                return Ok(None);
            }
            build_redirect_request(response, call)
        }
        300 | 301 | 302 | 303 => build_redirect_request(response, call),
        408 => {
            if !client.retry_on_connection_failure {
                return Ok(None);
            }
            if response
                .request()
                .body()
                .is_some_and(crate::request::RequestBody::is_one_shot)
            {
                return Ok(None);
            }
            if response
                .prior_response()
                .is_some_and(|prior| prior.status() == 408)
            {
                // Two timeouts in a row: the server means it.
                return Ok(None);
            }
            if retry_after_seconds(response, 0) > 0 {
                return Ok(None);
            }
            Ok(Some(response.request().clone()))
        }
        503 => {
            if response
                .prior_response()
                .is_some_and(|prior| prior.status() == 503)
            {
                return Ok(None);
            }
            // Only an explicit "retry immediately" is honored.
            if retry_after_seconds(response, i64::MAX) == 0 {
                return Ok(Some(response.request().clone()));
            }
            Ok(None)
        }
        421 => {
            if response
                .request()
                .body()
                .is_some_and(crate::request::RequestBody::is_one_shot)
            {
                return Ok(None);
            }
            // Misdirected request: we reached this server by coalescing
            // another host's connection. Stop coalescing and retry.
            let Some(exchange) = call.interceptor_scoped_exchange() else {
                return Ok(None);
            };
            let connection = exchange.connection();
            if connection
                .route()
                .endpoint
                .host()
                .eq_ignore_ascii_case(response.request().url().host_str().unwrap_or(""))
            {
                return Ok(None);
            }
            connection.no_coalesced_exchanges();
            Ok(Some(response.request().clone()))
        }
        _ => Ok(None),
    }
}

fn build_redirect_request(
    response: &Response,
    call: &crate::call::RealCall,
) -> Result<Option<Request>> {
    let client = call.client();
    if !client.follow_redirects {
        return Ok(None);
    }
    let Some(location) = response.header("location") else {
        return Ok(None);
    };
    let Ok(target) = response.request().url().join(location) else {
        return Ok(None);
    };
    // Schemes this client does not speak surface the 3xx unchanged.
    if !matches!(target.scheme(), "http" | "https") {
        return Ok(None);
    }
    if target.scheme() != response.request().url().scheme() && !client.follow_ssl_redirects {
        return Ok(None);
    }

    let method = response.request().method().clone();
    let mut builder = response.request().clone().into_builder();

    // Methods that permit a body either keep it (PROPFIND) or become a
    // bodyless GET, dropping the headers that described the body.
    if permits_request_body(&method) && !redirects_with_body(&method) {
        builder = builder
            .method(Method::GET)
            .no_body()
            .remove_header("transfer-encoding")
            .remove_header("content-length")
            .remove_header("content-type");
    }

    if !same_connection(response.request().url(), &target) {
        builder = builder.remove_header("authorization");
    }

    Ok(Some(builder.parsed_url(target).build()?))
}

fn same_connection(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str()
            .zip(b.host_str())
            .is_some_and(|(x, y)| x.eq_ignore_ascii_case(y))
        && a.port_or_known_default() == b.port_or_known_default()
}

/// `Retry-After` in whole seconds: `default` when absent, `i64::MAX` for
/// HTTP-date values (never "immediately").
fn retry_after_seconds(response: &Response, default: i64) -> i64 {
    match response.header("retry-after") {
        None => default,
        Some(value) if value.trim().bytes().all(|b| b.is_ascii_digit()) => {
            parse_seconds(value, default)
        }
        Some(_) => i64::MAX,
    }
}
