//! Header utilities: HTTP dates, `Vary` handling, and small parse helpers.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use http::header::{HeaderMap, HeaderName, HeaderValue};

/// Formats accepted for HTTP date fields, preferred form first
/// (RFC 9110 §5.6.7: IMF-fixdate, then RFC 850, then asctime).
const DATE_FORMATS: &[&str] = &[
    "%a, %d %b %Y %H:%M:%S GMT",
    "%A, %d-%b-%y %H:%M:%S GMT",
    "%a %b %e %H:%M:%S %Y",
];

/// Parse an HTTP date header value. Returns None for unparseable input.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    for format in DATE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

/// Render a date in IMF-fixdate form.
pub fn format_http_date(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Get a header as a string, ignoring values that are not valid UTF-8.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parse a decimal seconds header such as `Age` or `Retry-After`.
/// Values too large to represent saturate instead of failing.
pub fn parse_seconds(value: &str, default: i64) -> i64 {
    let value = value.trim();
    if value.is_empty() {
        return default;
    }
    match value.parse::<u64>() {
        Ok(n) => i64::try_from(n).unwrap_or(i64::MAX),
        Err(_) => {
            // "9999999999999" style overflow still means "a very long time".
            if value.bytes().all(|b| b.is_ascii_digit()) {
                i64::MAX
            } else {
                default
            }
        }
    }
}

/// The set of request-header names a response's `Vary` field nominates,
/// lowercased and deduplicated. `*` appears verbatim when present.
pub fn vary_fields(response_headers: &HeaderMap) -> BTreeSet<String> {
    let mut fields = BTreeSet::new();
    for value in response_headers.get_all(http::header::VARY) {
        let Ok(value) = value.to_str() else { continue };
        for name in value.split(',') {
            let name = name.trim();
            if !name.is_empty() {
                fields.insert(name.to_ascii_lowercase());
            }
        }
    }
    fields
}

/// Whether a response's `Vary` forbids caching entirely.
pub fn has_vary_all(response_headers: &HeaderMap) -> bool {
    vary_fields(response_headers).contains("*")
}

/// The sub-map of `request_headers` selected by the response's `Vary`
/// field; this is the cache key dimension beyond the URL.
pub fn vary_headers(request_headers: &HeaderMap, response_headers: &HeaderMap) -> HeaderMap {
    let fields = vary_fields(response_headers);
    let mut selected = HeaderMap::new();
    for field in &fields {
        if field == "*" {
            continue;
        }
        let Ok(name) = field.parse::<HeaderName>() else {
            continue;
        };
        for value in request_headers.get_all(&name) {
            selected.append(name.clone(), value.clone());
        }
    }
    selected
}

/// Whether the headers a stored entry varied on match the new request.
pub fn vary_matches(
    cached_vary_headers: &HeaderMap,
    response_headers: &HeaderMap,
    new_request_headers: &HeaderMap,
) -> bool {
    for field in vary_fields(response_headers) {
        if field == "*" {
            return false;
        }
        let Ok(name) = field.parse::<HeaderName>() else {
            return false;
        };
        let cached: Vec<&HeaderValue> = cached_vary_headers.get_all(&name).iter().collect();
        let current: Vec<&HeaderValue> = new_request_headers.get_all(&name).iter().collect();
        if cached != current {
            return false;
        }
    }
    true
}

/// True when a response to `method` with this status promises a body
/// (RFC 9110 §6.4.1: no body for 1xx, 204, 304, or any HEAD response).
pub fn promises_body(method: &http::Method, status: u16, headers: &HeaderMap) -> bool {
    if method == http::Method::HEAD {
        return false;
    }
    if (100..200).contains(&status) || status == 204 || status == 304 {
        // An entity can still be framed explicitly.
        return content_length(headers).unwrap_or(-1) != -1
            || header_str(headers, "transfer-encoding")
                .is_some_and(|te| te.eq_ignore_ascii_case("chunked"));
    }
    true
}

/// Parsed `Content-Length`, or None when absent or malformed.
pub fn content_length(headers: &HeaderMap) -> Option<i64> {
    header_str(headers, "content-length").and_then(|v| v.trim().parse::<i64>().ok())
}

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
