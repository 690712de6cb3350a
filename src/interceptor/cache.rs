//! Serves requests from the cache, revalidates stale entries, and writes
//! network responses back.

use async_trait::async_trait;

use crate::body::Body;
use crate::cache::{CacheStrategy, CacheWritingReader};
use crate::error::Result;
use crate::headers::{content_length, header_str, now_millis, promises_body};
use crate::protocol::Protocol;
use crate::request::invalidates_cache;
use crate::response::Response;

use super::{Chain, Interceptor};

pub struct CacheInterceptor;

#[async_trait]
impl Interceptor for CacheInterceptor {
    async fn intercept(&self, chain: &mut Chain) -> Result<Response> {
        let request = chain.request().clone();
        let cache = chain.call().client().cache.clone();

        let cached = match &cache {
            Some(cache) => cache.get(&request).await?,
            None => None,
        };

        let now = now_millis();
        let strategy = CacheStrategy::compute(now, &request, cached)?;
        if let Some(cache) = &cache {
            cache.track_strategy(&strategy);
        }
        let CacheStrategy {
            network_request,
            cache_response,
        } = strategy;

        // The request forbade the network and the cache cannot satisfy it.
        let Some(network_request) = network_request else {
            match cache_response {
                Some(mut response) => {
                    let meta = response.shallow_clone();
                    response.set_cache_response(Some(meta));
                    return Ok(response);
                }
                None => {
                    return Response::builder()
                        .request(request)
                        .protocol(Protocol::Http11)
                        .status(504)
                        .message("Unsatisfiable Request (only-if-cached)")
                        .sent_request_at_millis(now)
                        .received_response_at_millis(now)
                        .build();
                }
            }
        };

        let network_response = chain.proceed(network_request.clone()).await?;

        if let Some(mut cached) = cache_response {
            if network_response.status() == 304 {
                // The stored entity is still good: cache wins the body and
                // entity headers, the network wins freshness.
                let merged = combine_headers(cached.headers(), network_response.headers());
                let body = cached.take_body();
                cached.set_headers(merged);
                cached.set_timestamps(
                    network_response.sent_request_at_millis(),
                    network_response.received_response_at_millis(),
                );
                let cache_meta = cached.shallow_clone();
                cached.set_cache_response(Some(cache_meta));
                cached.set_network_response(Some(network_response));
                cached.set_body(body);
                if let Some(cache) = &cache {
                    cache.track_conditional_hit();
                    cache.update(&cached).await?;
                }
                return Ok(cached);
            }
        }

        let mut response = network_response;
        if let Some(cache) = &cache {
            if promises_body(request.method(), response.status(), response.headers())
                && CacheStrategy::is_cacheable(&response, &request)
            {
                if let Some(pending) = cache.prepare_put(&response) {
                    let content_type = header_str(response.headers(), "content-type")
                        .map(str::to_string);
                    let length = content_length(response.headers()).unwrap_or(-1);
                    let reader = CacheWritingReader::new(
                        response.take_body().into_reader(),
                        pending,
                        cache.clone(),
                    );
                    response.set_body(Body::from_reader(
                        Box::new(reader),
                        content_type,
                        length,
                    ));
                }
            }
            if invalidates_cache(request.method()) {
                // A successful unsafe method makes the stored entry stale.
                if let Err(e) = cache.remove(&request).await {
                    tracing::warn!(error = %e, "cache invalidation failed");
                }
            }
        }
        Ok(response)
    }
}

/// RFC 7234 §4.3.4 header merging for a validated (304) response.
fn combine_headers(
    cached: &http::HeaderMap,
    network: &http::HeaderMap,
) -> http::HeaderMap {
    let mut merged = http::HeaderMap::new();
    for (name, value) in cached {
        // Stale 1xx warnings are dropped; entity headers always survive;
        // other cached headers survive unless the network replaced them.
        let is_stale_warning = name.as_str() == "warning"
            && value.to_str().map_or(false, |v| v.starts_with('1'));
        if is_stale_warning {
            continue;
        }
        if is_content_specific(name.as_str())
            || !is_end_to_end(name.as_str())
            || network.get(name).is_none()
        {
            merged.append(name.clone(), value.clone());
        }
    }
    for (name, value) in network {
        if !is_content_specific(name.as_str()) && is_end_to_end(name.as_str()) {
            merged.append(name.clone(), value.clone());
        }
    }
    merged
}

fn is_content_specific(name: &str) -> bool {
    matches!(name, "content-length" | "content-encoding" | "content-type")
}

fn is_end_to_end(name: &str) -> bool {
    !matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderMap, HeaderName, HeaderValue};

    fn map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut m = HeaderMap::new();
        for (k, v) in pairs {
            m.append(
                k.parse::<HeaderName>().unwrap(),
                v.parse::<HeaderValue>().unwrap(),
            );
        }
        m
    }

    #[test]
    fn network_wins_freshness_cache_wins_entity() {
        let cached = map(&[
            ("content-type", "text/plain"),
            ("content-length", "10"),
            ("cache-control", "max-age=10"),
            ("etag", "\"v1\""),
        ]);
        let network = map(&[
            ("cache-control", "max-age=60"),
            ("content-type", "application/octet-stream"),
        ]);
        let merged = combine_headers(&cached, &network);
        assert_eq!(merged.get("cache-control").unwrap(), "max-age=60");
        assert_eq!(merged.get("content-type").unwrap(), "text/plain");
        assert_eq!(merged.get("content-length").unwrap(), "10");
        assert_eq!(merged.get("etag").unwrap(), "\"v1\"");
    }

    #[test]
    fn stale_warnings_dropped_on_merge() {
        let cached = map(&[("warning", "110 - \"stale\""), ("warning", "214 - \"transformed\"")]);
        let merged = combine_headers(&cached, &HeaderMap::new());
        let warnings: Vec<_> = merged.get_all("warning").iter().collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0], "214 - \"transformed\"");
    }

    #[test]
    fn hop_by_hop_not_copied_from_network() {
        let network = map(&[("connection", "close"), ("date", "x")]);
        let merged = combine_headers(&HeaderMap::new(), &network);
        assert!(merged.get("connection").is_none());
        assert!(merged.get("date").is_some());
    }
}
