//! HTTP response model.

use http::header::HeaderMap;

use crate::body::Body;
use crate::cache::CacheControl;
use crate::error::{Error, Result};
use crate::protocol::Protocol;
use crate::request::Request;
use crate::tls::Handshake;

/// Status line + headers, as produced by an exchange codec before the body
/// is opened.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub protocol: Protocol,
    pub status: u16,
    pub message: String,
    pub headers: HeaderMap,
}

/// An authentication challenge from a 401 or 407 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: String,
    pub realm: Option<String>,
}

/// An HTTP response.
///
/// `network_response`, `cache_response` and `prior_response` record how the
/// response was produced; their bodies are always stripped.
#[derive(Debug)]
pub struct Response {
    request: Request,
    protocol: Protocol,
    status: u16,
    message: String,
    headers: HeaderMap,
    body: Body,
    handshake: Option<Handshake>,
    network_response: Option<Box<Response>>,
    cache_response: Option<Box<Response>>,
    prior_response: Option<Box<Response>>,
    sent_request_at_millis: i64,
    received_response_at_millis: i64,
}

impl Response {
    pub fn builder() -> ResponseBuilder {
        ResponseBuilder::new()
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        crate::headers::header_str(&self.headers, name)
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    pub fn into_body(self) -> Body {
        self.body
    }

    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    pub fn network_response(&self) -> Option<&Response> {
        self.network_response.as_deref()
    }

    pub fn cache_response(&self) -> Option<&Response> {
        self.cache_response.as_deref()
    }

    pub fn prior_response(&self) -> Option<&Response> {
        self.prior_response.as_deref()
    }

    pub fn sent_request_at_millis(&self) -> i64 {
        self.sent_request_at_millis
    }

    pub fn received_response_at_millis(&self) -> i64 {
        self.received_response_at_millis
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 300 | 301 | 302 | 303 | 307 | 308)
    }

    /// Cache directives parsed from this response's headers.
    pub fn cache_control(&self) -> CacheControl {
        CacheControl::parse(&self.headers)
    }

    /// Challenges from `WWW-Authenticate` (401) or `Proxy-Authenticate`
    /// (407) headers, depending on this response's status.
    pub fn challenges(&self) -> Vec<Challenge> {
        let header = match self.status {
            401 => "www-authenticate",
            407 => "proxy-authenticate",
            _ => return Vec::new(),
        };
        let mut challenges = Vec::new();
        for value in self.headers.get_all(header) {
            let Ok(value) = value.to_str() else { continue };
            challenges.extend(parse_challenges(value));
        }
        challenges
    }

    /// This response with an empty body, keeping everything else.
    pub fn strip_body(mut self) -> Response {
        self.body = Body::empty();
        self
    }

    /// A bodyless copy of this response, nested responses included.
    /// Useful for carrying response metadata alongside a live body.
    pub fn shallow_clone(&self) -> Response {
        Response {
            request: self.request.clone(),
            protocol: self.protocol,
            status: self.status,
            message: self.message.clone(),
            headers: self.headers.clone(),
            body: Body::empty(),
            handshake: self.handshake.clone(),
            network_response: self
                .network_response
                .as_ref()
                .map(|r| Box::new(r.shallow_clone())),
            cache_response: self
                .cache_response
                .as_ref()
                .map(|r| Box::new(r.shallow_clone())),
            prior_response: self
                .prior_response
                .as_ref()
                .map(|r| Box::new(r.shallow_clone())),
            sent_request_at_millis: self.sent_request_at_millis,
            received_response_at_millis: self.received_response_at_millis,
        }
    }

    /// Take the body out, leaving an empty one behind.
    pub fn take_body(&mut self) -> Body {
        std::mem::replace(&mut self.body, Body::empty())
    }

    pub(crate) fn set_body(&mut self, body: Body) {
        self.body = body;
    }

    pub(crate) fn set_prior_response(&mut self, prior: Option<Response>) {
        self.prior_response = prior.map(|r| Box::new(r.strip_body()));
    }

    pub(crate) fn set_cache_response(&mut self, cache: Option<Response>) {
        self.cache_response = cache.map(|r| Box::new(r.strip_body()));
    }

    pub(crate) fn set_network_response(&mut self, network: Option<Response>) {
        self.network_response = network.map(|r| Box::new(r.strip_body()));
    }

    pub(crate) fn set_headers(&mut self, headers: HeaderMap) {
        self.headers = headers;
    }

    pub(crate) fn set_request(&mut self, request: Request) {
        self.request = request;
    }

    pub(crate) fn set_timestamps(&mut self, sent: i64, received: i64) {
        self.sent_request_at_millis = sent;
        self.received_response_at_millis = received;
    }

    /// Rebuild with parts open for edit; the body is not carried over.
    pub fn into_builder(self) -> ResponseBuilder {
        ResponseBuilder {
            request: Some(self.request),
            protocol: self.protocol,
            status: self.status,
            message: self.message,
            headers: self.headers,
            body: Body::empty(),
            handshake: self.handshake,
            network_response: self.network_response,
            cache_response: self.cache_response,
            prior_response: self.prior_response,
            sent_request_at_millis: self.sent_request_at_millis,
            received_response_at_millis: self.received_response_at_millis,
        }
    }
}

fn parse_challenges(value: &str) -> Vec<Challenge> {
    // Scheme token, then optional auth-params; a new scheme begins at a
    // token that is not followed by '='.
    let mut challenges = Vec::new();
    let mut scheme: Option<String> = None;
    let mut realm: Option<String> = None;
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (head, rest) = match part.split_once(' ') {
            Some((h, r)) => (h, Some(r.trim())),
            None => (part, None),
        };
        if !head.contains('=') {
            if let Some(s) = scheme.take() {
                challenges.push(Challenge { scheme: s, realm: realm.take() });
            }
            scheme = Some(head.to_string());
            if let Some(rest) = rest {
                if let Some(r) = parse_realm(rest) {
                    realm = Some(r);
                }
            }
        } else if let Some(r) = parse_realm(part) {
            realm = Some(r);
        }
    }
    if let Some(s) = scheme {
        challenges.push(Challenge { scheme: s, realm });
    }
    challenges
}

fn parse_realm(param: &str) -> Option<String> {
    let (key, value) = param.split_once('=')?;
    if !key.trim().eq_ignore_ascii_case("realm") {
        return None;
    }
    Some(value.trim().trim_matches('"').to_string())
}

/// Builder for [`Response`].
#[derive(Debug)]
pub struct ResponseBuilder {
    request: Option<Request>,
    protocol: Protocol,
    status: u16,
    message: String,
    headers: HeaderMap,
    body: Body,
    handshake: Option<Handshake>,
    network_response: Option<Box<Response>>,
    cache_response: Option<Box<Response>>,
    prior_response: Option<Box<Response>>,
    sent_request_at_millis: i64,
    received_response_at_millis: i64,
}

impl ResponseBuilder {
    pub fn new() -> Self {
        Self {
            request: None,
            protocol: Protocol::Http11,
            status: 0,
            message: String::new(),
            headers: HeaderMap::new(),
            body: Body::empty(),
            handshake: None,
            network_response: None,
            cache_response: None,
            prior_response: None,
            sent_request_at_millis: 0,
            received_response_at_millis: 0,
        }
    }

    pub fn request(mut self, request: Request) -> Self {
        self.request = Some(request);
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name: http::header::HeaderName = name
            .parse()
            .map_err(|_| Error::protocol(format!("invalid header name: {name}")))?;
        let value: http::header::HeaderValue = value
            .parse()
            .map_err(|_| Error::protocol(format!("invalid header value for {name}")))?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn remove_header(mut self, name: &str) -> Self {
        if let Ok(name) = name.parse::<http::header::HeaderName>() {
            self.headers.remove(name);
        }
        self
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn handshake(mut self, handshake: Option<Handshake>) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn network_response(mut self, response: Option<Response>) -> Self {
        self.network_response = response.map(|r| Box::new(r.strip_body()));
        self
    }

    pub fn cache_response(mut self, response: Option<Response>) -> Self {
        self.cache_response = response.map(|r| Box::new(r.strip_body()));
        self
    }

    pub fn prior_response(mut self, response: Option<Response>) -> Self {
        self.prior_response = response.map(|r| Box::new(r.strip_body()));
        self
    }

    pub fn sent_request_at_millis(mut self, millis: i64) -> Self {
        self.sent_request_at_millis = millis;
        self
    }

    pub fn received_response_at_millis(mut self, millis: i64) -> Self {
        self.received_response_at_millis = millis;
        self
    }

    pub fn build(self) -> Result<Response> {
        let request = self
            .request
            .ok_or_else(|| Error::protocol("response requires a request"))?;
        if self.status < 100 {
            return Err(Error::protocol(format!("status < 100: {}", self.status)));
        }
        Ok(Response {
            request,
            protocol: self.protocol,
            status: self.status,
            message: self.message,
            headers: self.headers,
            body: self.body,
            handshake: self.handshake,
            network_response: self.network_response,
            cache_response: self.cache_response,
            prior_response: self.prior_response,
            sent_request_at_millis: self.sent_request_at_millis,
            received_response_at_millis: self.received_response_at_millis,
        })
    }
}

impl Default for ResponseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with(status: u16, headers: &[(&str, &str)]) -> Response {
        let mut builder = Response::builder()
            .request(Request::get("https://example.com/").unwrap())
            .status(status)
            .message("Test");
        for (k, v) in headers {
            builder = builder.add_header(k, v).unwrap();
        }
        builder.build().unwrap()
    }

    #[test]
    fn challenges_for_401() {
        let r = response_with(401, &[("www-authenticate", "Basic realm=\"ops\"")]);
        assert_eq!(
            r.challenges(),
            vec![Challenge {
                scheme: "Basic".into(),
                realm: Some("ops".into())
            }]
        );
    }

    #[test]
    fn challenges_ignore_other_statuses() {
        let r = response_with(200, &[("www-authenticate", "Basic realm=\"ops\"")]);
        assert!(r.challenges().is_empty());
    }

    #[test]
    fn redirect_statuses() {
        for status in [300, 301, 302, 303, 307, 308] {
            assert!(response_with(status, &[]).is_redirect(), "{status}");
        }
        assert!(!response_with(200, &[]).is_redirect());
        assert!(!response_with(304, &[]).is_redirect());
    }
}
