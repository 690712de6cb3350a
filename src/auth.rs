//! RFC 7617 Basic credentials and the authenticator seam.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::Result;
use crate::request::Request;
use crate::response::Response;
use crate::route::Route;

/// Generate a Basic Auth header value (RFC 7617).
pub fn basic_auth(username: &str, password: &str) -> String {
    let plain = format!("{username}:{password}");
    format!("Basic {}", BASE64.encode(plain))
}

/// Parse a Basic Auth header value into (username, password).
pub fn parse_basic_auth(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?.trim();
    let decoded = BASE64.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Reacts to a 401 or 407 challenge by producing a request with
/// credentials attached, or None to give up and surface the response.
///
/// For proxy challenges `route` carries the proxy being authenticated;
/// for origin challenges it is the route the response arrived on, when
/// known.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        route: Option<&Route>,
        response: &Response,
    ) -> Result<Option<Request>>;
}

/// Authenticator that never retries; challenges surface to the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuthenticator;

#[async_trait]
impl Authenticator for NoAuthenticator {
    async fn authenticate(
        &self,
        _route: Option<&Route>,
        _response: &Response,
    ) -> Result<Option<Request>> {
        Ok(None)
    }
}

/// Answers Basic challenges with a fixed username and password, once.
#[derive(Debug, Clone)]
pub struct BasicAuthenticator {
    username: String,
    password: String,
}

impl BasicAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl Authenticator for BasicAuthenticator {
    async fn authenticate(
        &self,
        _route: Option<&Route>,
        response: &Response,
    ) -> Result<Option<Request>> {
        let header = if response.status() == 407 {
            "proxy-authorization"
        } else {
            "authorization"
        };
        if response.request().header(header).is_some() {
            // Credentials were already tried and rejected.
            return Ok(None);
        }
        if !response
            .challenges()
            .iter()
            .any(|c| c.scheme.eq_ignore_ascii_case("basic"))
        {
            return Ok(None);
        }
        let request = response
            .request()
            .clone()
            .into_builder()
            .set_header(header, &basic_auth(&self.username, &self.password))?
            .build()?;
        Ok(Some(request))
    }
}
