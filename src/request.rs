//! HTTP request model.

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;
use url::Url;

use crate::cache::CacheControl;
use crate::error::{Error, Result};

/// A request body held in memory, or a one-shot marker for bodies that can
/// be written only once (streamed uploads).
#[derive(Debug, Clone)]
pub struct RequestBody {
    content: Bytes,
    content_type: Option<String>,
    one_shot: bool,
}

impl RequestBody {
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
            content_type: None,
            one_shot: false,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Mark this body as writable only once; the retry loop will not
    /// replay it after send has begun.
    pub fn one_shot(mut self) -> Self {
        self.one_shot = true;
        self
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Length in bytes, `-1` when unknown ahead of writing.
    pub fn content_length(&self) -> i64 {
        self.content.len() as i64
    }

    pub fn is_one_shot(&self) -> bool {
        self.one_shot
    }
}

/// Whether `method` may carry a request body.
pub fn permits_request_body(method: &Method) -> bool {
    !matches!(method.as_str(), "GET" | "HEAD")
}

/// Whether a redirect of `method` preserves the method and body
/// (RFC 9110 §15.4: only PROPFIND keeps its body across 3xx).
pub fn redirects_with_body(method: &Method) -> bool {
    method.as_str() == "PROPFIND"
}

/// Whether a 300/301/302/303 redirect rewrites `method` to GET.
pub fn redirects_to_get(method: &Method) -> bool {
    method.as_str() != "PROPFIND"
}

/// Whether `method` can invalidate a cached entry on success.
pub fn invalidates_cache(method: &Method) -> bool {
    matches!(method.as_str(), "POST" | "PATCH" | "PUT" | "DELETE" | "MOVE")
}

/// An immutable HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<RequestBody>,
}

impl Request {
    pub fn builder() -> RequestBuilder {
        RequestBuilder::new()
    }

    /// GET request for `url`.
    pub fn get(url: impl AsRef<str>) -> Result<Self> {
        RequestBuilder::new().url(url)?.build()
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        crate::headers::header_str(&self.headers, name)
    }

    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }

    /// Cache directives parsed from this request's headers.
    pub fn cache_control(&self) -> CacheControl {
        CacheControl::parse(&self.headers)
    }

    pub fn is_https(&self) -> bool {
        self.url.scheme() == "https"
    }

    /// Rebuild this request with its parts open for edit.
    pub fn into_builder(self) -> RequestBuilder {
        RequestBuilder {
            method: self.method,
            url: Some(self.url),
            headers: self.headers,
            body: self.body,
        }
    }
}

/// Builder for [`Request`].
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    method: Method,
    url: Option<Url>,
    headers: HeaderMap,
    body: Option<RequestBody>,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            method: Method::GET,
            url: None,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn url(mut self, url: impl AsRef<str>) -> Result<Self> {
        let url = Url::parse(url.as_ref())?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(Error::UnsupportedUrl(format!("scheme {other}"))),
        }
        if url.host_str().is_none() {
            return Err(Error::UnsupportedUrl("missing host".into()));
        }
        self.url = Some(url);
        Ok(self)
    }

    pub fn parsed_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Append a header, keeping any existing values for the same name.
    pub fn add_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name: HeaderName = name
            .parse()
            .map_err(|_| Error::protocol(format!("invalid header name: {name}")))?;
        let value: HeaderValue = value
            .parse()
            .map_err(|_| Error::protocol(format!("invalid header value for {name}")))?;
        self.headers.append(name, value);
        Ok(self)
    }

    /// Set a header, replacing all existing values for the same name.
    pub fn set_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name: HeaderName = name
            .parse()
            .map_err(|_| Error::protocol(format!("invalid header name: {name}")))?;
        let value: HeaderValue = value
            .parse()
            .map_err(|_| Error::protocol(format!("invalid header value for {name}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn remove_header(mut self, name: &str) -> Self {
        if let Ok(name) = name.parse::<HeaderName>() {
            self.headers.remove(name);
        }
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn no_body(mut self) -> Self {
        self.body = None;
        self
    }

    /// Replace the request's cache directives with `cache_control`,
    /// dropping the header entirely when the directives are empty.
    pub fn cache_control(self, cache_control: &CacheControl) -> Result<Self> {
        let rendered = cache_control.to_string();
        if rendered.is_empty() {
            Ok(self.remove_header("cache-control"))
        } else {
            self.set_header("cache-control", &rendered)
        }
    }

    pub fn build(self) -> Result<Request> {
        let url = self.url.ok_or_else(|| Error::UnsupportedUrl("no URL".into()))?;
        if self.body.is_some() && !permits_request_body(&self.method) {
            return Err(Error::protocol(format!(
                "method {} must not have a request body",
                self.method
            )));
        }
        Ok(Request {
            method: self.method,
            url,
            headers: self.headers,
            body: self.body,
        })
    }
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}
