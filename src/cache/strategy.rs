//! Given a request and a stored response, decides whether to use the
//! network, the cache, or a conditional request (RFC 7234).

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::headers::{parse_http_date, parse_seconds};
use crate::request::Request;
use crate::response::Response;

const ONE_DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// The outcome of [`CacheStrategy::compute`].
///
/// - network request and cache response both present: conditional GET.
/// - only the network request: go to the network.
/// - only the cache response: serve from cache.
/// - neither: the request forbade the network and the cache cannot satisfy
///   it; the caller synthesizes a 504.
#[derive(Debug)]
pub struct CacheStrategy {
    pub network_request: Option<Request>,
    pub cache_response: Option<Response>,
}

impl CacheStrategy {
    pub fn compute(now_millis: i64, request: &Request, cached: Option<Response>) -> Result<Self> {
        let candidate = Factory::new(now_millis, request, cached).compute()?;
        if candidate.network_request.is_some() && request.cache_control().only_if_cached {
            // Forbidden to use the network, but the cache is insufficient.
            return Ok(CacheStrategy {
                network_request: None,
                cache_response: None,
            });
        }
        Ok(candidate)
    }

    /// Whether `response` may be stored to later satisfy `request`.
    pub fn is_cacheable(response: &Response, request: &Request) -> bool {
        match response.status() {
            200 | 203 | 204 | 300 | 301 | 308 | 404 | 405 | 410 | 414 | 501 => {}
            302 | 307 => {
                // Only cacheable with explicit freshness or authorization.
                let cc = response.cache_control();
                let has_expires = response.header("expires").is_some();
                if !has_expires
                    && cc.max_age_secs == -1
                    && !cc.is_public
                    && !cc.is_private
                {
                    return false;
                }
            }
            _ => return false,
        }
        !response.cache_control().no_store && !request.cache_control().no_store
    }
}

struct Factory<'a> {
    now_millis: i64,
    request: &'a Request,
    cached: Option<Response>,
    /// The server's own clock when the response was served.
    served_date: Option<DateTime<Utc>>,
    served_date_text: Option<String>,
    last_modified: Option<DateTime<Utc>>,
    last_modified_text: Option<String>,
    expires: Option<DateTime<Utc>>,
    /// When the request that produced the cached response left this client.
    sent_request_millis: i64,
    received_response_millis: i64,
    etag: Option<String>,
    age_seconds: i64,
}

impl<'a> Factory<'a> {
    fn new(now_millis: i64, request: &'a Request, cached: Option<Response>) -> Self {
        let mut factory = Self {
            now_millis,
            request,
            cached: None,
            served_date: None,
            served_date_text: None,
            last_modified: None,
            last_modified_text: None,
            expires: None,
            sent_request_millis: 0,
            received_response_millis: 0,
            etag: None,
            age_seconds: -1,
        };
        if let Some(cached) = cached {
            factory.sent_request_millis = cached.sent_request_at_millis();
            factory.received_response_millis = cached.received_response_at_millis();
            if let Some(v) = cached.header("date") {
                factory.served_date = parse_http_date(v);
                factory.served_date_text = Some(v.to_string());
            }
            if let Some(v) = cached.header("last-modified") {
                factory.last_modified = parse_http_date(v);
                factory.last_modified_text = Some(v.to_string());
            }
            factory.expires = cached.header("expires").and_then(parse_http_date);
            factory.etag = cached.header("etag").map(str::to_string);
            factory.age_seconds = cached
                .header("age")
                .map_or(-1, |v| parse_seconds(v, -1));
            factory.cached = Some(cached);
        }
        factory
    }

    fn compute(mut self) -> Result<CacheStrategy> {
        let Some(cached) = self.cached.take() else {
            return Ok(self.network_only());
        };

        // An https response without a recorded handshake is not trusted.
        if self.request.is_https() && cached.handshake().is_none() {
            return Ok(self.network_only());
        }

        if !CacheStrategy::is_cacheable(&cached, self.request) {
            return Ok(self.network_only());
        }

        let request_caching = self.request.cache_control();
        if request_caching.no_cache || has_conditions(self.request) {
            return Ok(self.network_only());
        }

        let response_caching = cached.cache_control();

        let age_millis = self.cache_response_age();
        let mut fresh_millis = self.compute_freshness_lifetime(&cached);
        if request_caching.max_age_secs != -1 {
            fresh_millis = fresh_millis.min(request_caching.max_age_secs.saturating_mul(1000));
        }

        let min_fresh_millis = if request_caching.min_fresh_secs != -1 {
            request_caching.min_fresh_secs.saturating_mul(1000)
        } else {
            0
        };

        // max-stale only widens the window when the stored response does
        // not insist on revalidation.
        let max_stale_millis = if !response_caching.must_revalidate
            && request_caching.max_stale_secs != -1
        {
            request_caching.max_stale_secs.saturating_mul(1000)
        } else {
            0
        };

        if !response_caching.no_cache
            && age_millis.saturating_add(min_fresh_millis)
                < fresh_millis.saturating_add(max_stale_millis)
        {
            let mut cached = cached;
            let body = cached.take_body();
            let mut builder = cached.into_builder();
            if age_millis.saturating_add(min_fresh_millis) >= fresh_millis {
                builder = builder
                    .add_header("warning", "110 kestrel \"Response is stale\"")?;
            }
            if age_millis > ONE_DAY_MILLIS && self.is_freshness_lifetime_heuristic(&response_caching)
            {
                builder = builder
                    .add_header("warning", "113 kestrel \"Heuristic expiration\"")?;
            }
            let mut response = builder.build()?;
            response.set_body(body);
            return Ok(CacheStrategy {
                network_request: None,
                cache_response: Some(response),
            });
        }

        // Stale: find a validator to send a conditional request with.
        let (condition_name, condition_value) = if let Some(etag) = &self.etag {
            ("if-none-match", etag.clone())
        } else if let Some(text) = &self.last_modified_text {
            ("if-modified-since", text.clone())
        } else if let Some(text) = &self.served_date_text {
            ("if-modified-since", text.clone())
        } else {
            // Age budget exceeded and nothing to validate against.
            return Ok(CacheStrategy {
                network_request: Some(self.request.clone()),
                cache_response: None,
            });
        };

        let conditional_request = self
            .request
            .clone()
            .into_builder()
            .set_header(condition_name, &condition_value)?
            .build()?;
        Ok(CacheStrategy {
            network_request: Some(conditional_request),
            cache_response: Some(cached),
        })
    }

    fn network_only(&self) -> CacheStrategy {
        CacheStrategy {
            network_request: Some(self.request.clone()),
            cache_response: None,
        }
    }

    /// RFC 7234 §4.2.3: current age of the stored response.
    fn cache_response_age(&self) -> i64 {
        let apparent_received_age = self
            .served_date
            .map(|served| (self.received_response_millis - served.timestamp_millis()).max(0))
            .unwrap_or(0);
        let received_age = if self.age_seconds != -1 {
            apparent_received_age.max(self.age_seconds.saturating_mul(1000))
        } else {
            apparent_received_age
        };
        let response_duration = self.received_response_millis - self.sent_request_millis;
        let resident_duration = self.now_millis - self.received_response_millis;
        received_age
            .saturating_add(response_duration)
            .saturating_add(resident_duration)
    }

    /// RFC 7234 §4.2.1: how long the response stays fresh from service.
    fn compute_freshness_lifetime(&self, cached: &Response) -> i64 {
        let response_caching = cached.cache_control();
        if response_caching.max_age_secs != -1 {
            return response_caching.max_age_secs.saturating_mul(1000);
        }
        if let Some(expires) = self.expires {
            let served_millis = self
                .served_date
                .map(|d| d.timestamp_millis())
                .unwrap_or(self.received_response_millis);
            return (expires.timestamp_millis() - served_millis).max(0);
        }
        if let Some(last_modified) = self.last_modified {
            if self.request.url().query().is_none() {
                // Heuristic freshness: a tenth of the document's age when
                // it was served.
                let served_millis = self
                    .served_date
                    .map(|d| d.timestamp_millis())
                    .unwrap_or(self.sent_request_millis);
                let delta = served_millis - last_modified.timestamp_millis();
                return if delta > 0 { delta / 10 } else { 0 };
            }
        }
        0
    }

    fn is_freshness_lifetime_heuristic(&self, response_caching: &super::CacheControl) -> bool {
        response_caching.max_age_secs == -1 && self.expires.is_none()
    }
}

fn has_conditions(request: &Request) -> bool {
    request.header("if-modified-since").is_some() || request.header("if-none-match").is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::format_http_date;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        // A fixed wall clock keeps these tests deterministic.
        parse_http_date("Mon, 01 Jul 2024 12:00:00 GMT").unwrap()
    }

    fn request(url: &str) -> Request {
        Request::get(url).unwrap()
    }

    fn cached_response(
        request_sent_ago: Duration,
        headers: &[(&str, &str)],
    ) -> Response {
        let received = now() - request_sent_ago;
        let mut builder = Response::builder()
            .request(request("http://example.com/a"))
            .status(200)
            .message("OK")
            .sent_request_at_millis(received.timestamp_millis())
            .received_response_at_millis(received.timestamp_millis());
        for (k, v) in headers {
            builder = builder.add_header(k, v).unwrap();
        }
        builder.build().unwrap()
    }

    fn compute(request: &Request, cached: Option<Response>) -> CacheStrategy {
        CacheStrategy::compute(now().timestamp_millis(), request, cached).unwrap()
    }

    #[test]
    fn no_cached_response_goes_to_network() {
        let s = compute(&request("http://example.com/a"), None);
        assert!(s.network_request.is_some());
        assert!(s.cache_response.is_none());
    }

    #[test]
    fn fresh_response_served_from_cache() {
        let served = now() - Duration::minutes(1);
        let cached = cached_response(
            Duration::minutes(1),
            &[
                ("date", &format_http_date(served)),
                ("cache-control", "max-age=120"),
            ],
        );
        let s = compute(&request("http://example.com/a"), Some(cached));
        assert!(s.network_request.is_none());
        let cache_response = s.cache_response.unwrap();
        assert!(cache_response.header("warning").is_none());
    }

    #[test]
    fn expired_response_with_etag_goes_conditional() {
        let served = now() - Duration::minutes(10);
        let cached = cached_response(
            Duration::minutes(10),
            &[
                ("date", &format_http_date(served)),
                ("cache-control", "max-age=60"),
                ("etag", "\"v1\""),
            ],
        );
        let s = compute(&request("http://example.com/a"), Some(cached));
        let network = s.network_request.unwrap();
        assert_eq!(network.header("if-none-match"), Some("\"v1\""));
        assert!(s.cache_response.is_some());
    }

    #[test]
    fn expired_response_with_last_modified_goes_conditional() {
        let served = now() - Duration::minutes(10);
        let last_modified = now() - Duration::days(3);
        let cached = cached_response(
            Duration::minutes(10),
            &[
                ("date", &format_http_date(served)),
                ("cache-control", "max-age=60"),
                ("last-modified", &format_http_date(last_modified)),
            ],
        );
        let s = compute(&request("http://example.com/a"), Some(cached));
        assert_eq!(
            s.network_request.unwrap().header("if-modified-since"),
            Some(format_http_date(last_modified).as_str())
        );
    }

    #[test]
    fn expired_response_without_validator_goes_network_only() {
        let cached = cached_response(Duration::minutes(10), &[("cache-control", "max-age=60")]);
        let s = compute(&request("http://example.com/a"), Some(cached));
        assert!(s.network_request.is_some());
        assert!(s.cache_response.is_none());
    }

    #[test]
    fn request_no_cache_forces_network() {
        let served = now();
        let cached = cached_response(
            Duration::zero(),
            &[
                ("date", &format_http_date(served)),
                ("cache-control", "max-age=600"),
            ],
        );
        let r = request("http://example.com/a")
            .into_builder()
            .set_header("cache-control", "no-cache")
            .unwrap()
            .build()
            .unwrap();
        let s = compute(&r, Some(cached));
        assert!(s.network_request.is_some());
        assert!(s.cache_response.is_none());
    }

    #[test]
    fn preexisting_conditions_force_network() {
        let cached = cached_response(Duration::zero(), &[("cache-control", "max-age=600")]);
        let r = request("http://example.com/a")
            .into_builder()
            .set_header("if-none-match", "\"x\"")
            .unwrap()
            .build()
            .unwrap();
        let s = compute(&r, Some(cached));
        assert!(s.cache_response.is_none());
    }

    #[test]
    fn only_if_cached_with_no_entry_forbids_both() {
        let r = request("http://example.com/a")
            .into_builder()
            .set_header("cache-control", "only-if-cached")
            .unwrap()
            .build()
            .unwrap();
        let s = compute(&r, None);
        assert!(s.network_request.is_none());
        assert!(s.cache_response.is_none());
    }

    #[test]
    fn max_stale_accepts_staleness() {
        let served = now() - Duration::minutes(10);
        let cached = cached_response(
            Duration::minutes(10),
            &[
                ("date", &format_http_date(served)),
                ("cache-control", "max-age=60"),
            ],
        );
        let r = request("http://example.com/a")
            .into_builder()
            .set_header("cache-control", "max-stale")
            .unwrap()
            .build()
            .unwrap();
        let s = compute(&r, Some(cached));
        assert!(s.network_request.is_none());
        let warning = s.cache_response.unwrap();
        assert!(warning
            .header("warning")
            .is_some_and(|w| w.starts_with("110")));
    }

    #[test]
    fn must_revalidate_defeats_max_stale() {
        let served = now() - Duration::minutes(10);
        let cached = cached_response(
            Duration::minutes(10),
            &[
                ("date", &format_http_date(served)),
                ("cache-control", "max-age=60, must-revalidate"),
            ],
        );
        let r = request("http://example.com/a")
            .into_builder()
            .set_header("cache-control", "max-stale")
            .unwrap()
            .build()
            .unwrap();
        let s = compute(&r, Some(cached));
        assert!(s.network_request.is_some());
    }

    #[test]
    fn heuristic_expiration_warns_after_a_day() {
        let served = now() - Duration::days(5);
        let last_modified = now() - Duration::days(105);
        let mut cached = cached_response(
            Duration::days(5),
            &[
                ("date", &format_http_date(served)),
                ("last-modified", &format_http_date(last_modified)),
            ],
        );
        // The entry was fetched five days ago.
        cached = cached
            .into_builder()
            .sent_request_at_millis((now() - Duration::days(5)).timestamp_millis())
            .received_response_at_millis((now() - Duration::days(5)).timestamp_millis())
            .build()
            .unwrap();
        let s = compute(&request("http://example.com/a"), Some(cached));
        // 10 days of heuristic freshness remain, so cache serves, but a
        // heuristic-expiration warning rides along.
        assert!(s.network_request.is_none());
        let response = s.cache_response.unwrap();
        let warnings: Vec<&str> = response
            .headers()
            .get_all("warning")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        assert!(warnings.iter().any(|w| w.starts_with("113")));
    }

    #[test]
    fn heuristic_skipped_for_urls_with_query() {
        let served = now() - Duration::minutes(1);
        let last_modified = now() - Duration::days(100);
        let cached = Response::builder()
            .request(request("http://example.com/a?q=1"))
            .status(200)
            .message("OK")
            .add_header("date", &format_http_date(served))
            .unwrap()
            .add_header("last-modified", &format_http_date(last_modified))
            .unwrap()
            .sent_request_at_millis(served.timestamp_millis())
            .received_response_at_millis(served.timestamp_millis())
            .build()
            .unwrap();
        let s = compute(&request("http://example.com/a?q=1"), Some(cached));
        // No freshness lifetime at all: conditional on the date header.
        assert!(s.network_request.is_some());
    }

    #[test]
    fn https_without_handshake_goes_to_network() {
        let cached = Response::builder()
            .request(request("https://example.com/a"))
            .status(200)
            .message("OK")
            .add_header("cache-control", "max-age=600")
            .unwrap()
            .build()
            .unwrap();
        let s = compute(&request("https://example.com/a"), Some(cached));
        assert!(s.network_request.is_some());
        assert!(s.cache_response.is_none());
    }

    #[test]
    fn uncacheable_status_goes_to_network() {
        let cached = Response::builder()
            .request(request("http://example.com/a"))
            .status(500)
            .message("Server Error")
            .add_header("cache-control", "max-age=600")
            .unwrap()
            .build()
            .unwrap();
        let s = compute(&request("http://example.com/a"), Some(cached));
        assert!(s.cache_response.is_none());
    }

    #[test]
    fn redirect_302_needs_explicit_freshness() {
        let bare = Response::builder()
            .request(request("http://example.com/a"))
            .status(302)
            .message("Found")
            .build()
            .unwrap();
        assert!(!CacheStrategy::is_cacheable(
            &bare,
            &request("http://example.com/a")
        ));
        let with_max_age = Response::builder()
            .request(request("http://example.com/a"))
            .status(302)
            .message("Found")
            .add_header("cache-control", "max-age=60")
            .unwrap()
            .build()
            .unwrap();
        assert!(CacheStrategy::is_cacheable(
            &with_max_age,
            &request("http://example.com/a")
        ));
    }

    #[test]
    fn no_store_is_never_cacheable() {
        let stored = Response::builder()
            .request(request("http://example.com/a"))
            .status(200)
            .message("OK")
            .add_header("cache-control", "no-store")
            .unwrap()
            .build()
            .unwrap();
        assert!(!CacheStrategy::is_cacheable(
            &stored,
            &request("http://example.com/a")
        ));
    }
}
