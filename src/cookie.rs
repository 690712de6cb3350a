//! RFC 6265 cookie handling and the cookie-store seam.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use url::Url;

/// A cookie, as stored between requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    pub expires: Option<DateTime<Utc>>,
    /// Set when the cookie had no Domain attribute: sent to the exact
    /// host only.
    pub host_only: bool,
}

impl Cookie {
    /// Parse one `Set-Cookie` header received from `url`. Returns None
    /// for cookies that are malformed or not acceptable from that origin.
    pub fn parse(header: &str, url: &Url) -> Option<Self> {
        let request_host = url.host_str()?.to_ascii_lowercase();
        let mut parts = header.split(';').map(str::trim);
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Cookie {
            name: name.to_string(),
            value: value.trim().to_string(),
            domain: request_host.clone(),
            path: default_path(url),
            secure: false,
            http_only: false,
            expires: None,
            host_only: true,
        };
        let mut max_age: Option<i64> = None;

        for attribute in parts {
            let (key, val) = match attribute.split_once('=') {
                Some((k, v)) => (k.trim().to_ascii_lowercase(), v.trim()),
                None => (attribute.to_ascii_lowercase(), ""),
            };
            match key.as_str() {
                "domain" => {
                    let domain = val.trim_start_matches('.').to_ascii_lowercase();
                    if domain.is_empty() || !domain_matches(&request_host, &domain) {
                        return None;
                    }
                    cookie.domain = domain;
                    cookie.host_only = false;
                }
                "path" => {
                    if val.starts_with('/') {
                        cookie.path = val.to_string();
                    }
                }
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                "expires" => {
                    if let Some(date) = crate::headers::parse_http_date(val) {
                        // Max-Age wins over Expires when both appear.
                        if max_age.is_none() {
                            cookie.expires = Some(date);
                        }
                    }
                }
                "max-age" => {
                    if let Ok(secs) = val.parse::<i64>() {
                        max_age = Some(secs);
                        cookie.expires = Some(Utc::now() + Duration::seconds(secs.max(0)));
                    }
                }
                _ => {}
            }
        }
        Some(cookie)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    /// Whether this cookie should be sent with a request to `url`.
    pub fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            domain_matches(&host, &self.domain)
        };
        domain_ok
            && path_matches(url.path(), &self.path)
            && (!self.secure || url.scheme() == "https")
    }
}

fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => path[..i].to_string(),
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || (host.ends_with(domain) && host[..host.len() - domain.len()].ends_with('.'))
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    request_path == cookie_path
        || (request_path.starts_with(cookie_path)
            && (cookie_path.ends_with('/')
                || request_path[cookie_path.len()..].starts_with('/')))
}

/// Provides cookies for outbound requests and accepts them from
/// responses. External collaborator; an in-memory jar is provided.
#[async_trait]
pub trait CookieJar: Send + Sync {
    async fn load(&self, url: &Url) -> Vec<Cookie>;
    async fn save(&self, url: &Url, cookies: Vec<Cookie>);
}

/// Jar that never stores or returns cookies.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCookieJar;

#[async_trait]
impl CookieJar for NoCookieJar {
    async fn load(&self, _url: &Url) -> Vec<Cookie> {
        Vec::new()
    }

    async fn save(&self, _url: &Url, _cookies: Vec<Cookie>) {}
}

/// Process-lifetime jar keyed by (domain, path, name).
#[derive(Debug, Default)]
pub struct InMemoryCookieJar {
    cookies: Mutex<HashMap<(String, String, String), Cookie>>,
}

impl InMemoryCookieJar {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CookieJar for InMemoryCookieJar {
    async fn load(&self, url: &Url) -> Vec<Cookie> {
        let now = Utc::now();
        let mut cookies = self.cookies.lock().unwrap_or_else(|e| e.into_inner());
        cookies.retain(|_, cookie| !cookie.is_expired(now));
        let mut matched: Vec<Cookie> = cookies
            .values()
            .filter(|cookie| cookie.matches(url))
            .cloned()
            .collect();
        // Longer paths first, per RFC 6265 §5.4.
        matched.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        matched
    }

    async fn save(&self, _url: &Url, incoming: Vec<Cookie>) {
        let now = Utc::now();
        let mut cookies = self.cookies.lock().unwrap_or_else(|e| e.into_inner());
        for cookie in incoming {
            let key = (
                cookie.domain.clone(),
                cookie.path.clone(),
                cookie.name.clone(),
            );
            if cookie.is_expired(now) {
                cookies.remove(&key);
            } else {
                cookies.insert(key, cookie);
            }
        }
    }
}

/// Render cookies as a `Cookie` request header value.
pub fn cookie_header(cookies: &[Cookie]) -> String {
    cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn parse_simple_cookie() {
        let c = Cookie::parse("sid=abc123; Path=/; Secure", &url("https://example.com/a")).unwrap();
        assert_eq!(c.name, "sid");
        assert_eq!(c.value, "abc123");
        assert_eq!(c.path, "/");
        assert!(c.secure);
        assert!(c.host_only);
    }

    #[test]
    fn domain_attribute_widens_scope() {
        let c = Cookie::parse(
            "a=1; Domain=example.com",
            &url("https://sub.example.com/"),
        )
        .unwrap();
        assert!(!c.host_only);
        assert!(c.matches(&url("https://other.example.com/")));
        assert!(!c.matches(&url("https://example.org/")));
    }

    #[test]
    fn foreign_domain_rejected() {
        assert!(Cookie::parse("a=1; Domain=evil.com", &url("https://example.com/")).is_none());
    }

    #[test]
    fn secure_cookie_not_sent_over_http() {
        let c = Cookie::parse("a=1; Secure", &url("https://example.com/")).unwrap();
        assert!(c.matches(&url("https://example.com/")));
        assert!(!c.matches(&url("http://example.com/")));
    }

    #[tokio::test]
    async fn jar_round_trip_and_header() {
        let jar = InMemoryCookieJar::new();
        let u = url("https://example.com/shop/cart");
        let cookies = vec![
            Cookie::parse("sid=s1; Path=/", &u).unwrap(),
            Cookie::parse("cart=c9; Path=/shop", &u).unwrap(),
        ];
        jar.save(&u, cookies).await;
        let loaded = jar.load(&u).await;
        assert_eq!(loaded.len(), 2);
        // Longest path first.
        assert_eq!(loaded[0].name, "cart");
        assert_eq!(cookie_header(&loaded), "cart=c9; sid=s1");
    }

    #[tokio::test]
    async fn expired_cookie_removed() {
        let jar = InMemoryCookieJar::new();
        let u = url("https://example.com/");
        jar.save(&u, vec![Cookie::parse("a=1; Max-Age=60", &u).unwrap()])
            .await;
        assert_eq!(jar.load(&u).await.len(), 1);
        jar.save(&u, vec![Cookie::parse("a=1; Max-Age=0", &u).unwrap()])
            .await;
        assert!(jar.load(&u).await.is_empty());
    }
}
