//! Bridges application requests to network requests: header synthesis,
//! cookies, and transparent gzip.

use async_trait::async_trait;

use crate::body::{Body, GzipReader};
use crate::cookie::{cookie_header, Cookie};
use crate::error::Result;
use crate::headers::promises_body;
use crate::response::Response;

use super::{Chain, Interceptor};

pub struct BridgeInterceptor;

#[async_trait]
impl Interceptor for BridgeInterceptor {
    async fn intercept(&self, chain: &mut Chain) -> Result<Response> {
        let user_request = chain.request().clone();
        let client = chain.call().client().clone();
        let mut builder = user_request.clone().into_builder();

        if let Some(body) = user_request.body() {
            if let Some(content_type) = body.content_type() {
                if user_request.header("content-type").is_none() {
                    builder = builder.set_header("content-type", content_type)?;
                }
            }
            let content_length = body.content_length();
            if content_length != -1 {
                if user_request.header("content-length").is_none() {
                    builder = builder.set_header("content-length", &content_length.to_string())?;
                }
                builder = builder.remove_header("transfer-encoding");
            } else {
                if user_request.header("transfer-encoding").is_none() {
                    builder = builder.set_header("transfer-encoding", "chunked")?;
                }
                builder = builder.remove_header("content-length");
            }
        }

        if user_request.header("host").is_none() {
            builder = builder.set_header("host", &host_header(&user_request))?;
        }
        if user_request.header("connection").is_none() {
            builder = builder.set_header("connection", "Keep-Alive")?;
        }

        // Ask for gzip when the caller expressed no encoding or range
        // preference of their own; remember that the decode is on us.
        let transparent_gzip = user_request.header("accept-encoding").is_none()
            && user_request.header("range").is_none();
        if transparent_gzip {
            builder = builder.set_header("accept-encoding", "gzip")?;
        }

        let cookies = client.cookie_jar.load(user_request.url()).await;
        if !cookies.is_empty() {
            builder = builder.set_header("cookie", &cookie_header(&cookies))?;
        }

        if user_request.header("user-agent").is_none() {
            builder = builder.set_header("user-agent", &client.user_agent)?;
        }

        let network_request = builder.build()?;
        let mut response = chain.proceed(network_request.clone()).await?;

        let received: Vec<Cookie> = response
            .headers()
            .get_all("set-cookie")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| Cookie::parse(v, network_request.url()))
            .collect();
        if !received.is_empty() {
            client.cookie_jar.save(network_request.url(), received).await;
        }

        if transparent_gzip
            && response
                .header("content-encoding")
                .is_some_and(|e| e.eq_ignore_ascii_case("gzip"))
            && promises_body(
                network_request.method(),
                response.status(),
                response.headers(),
            )
        {
            let content_type = response.header("content-type").map(str::to_string);
            let mut headers = response.headers().clone();
            headers.remove("content-encoding");
            headers.remove("content-length");
            response.set_headers(headers);
            let inner = response.take_body().into_reader();
            response.set_body(Body::from_reader(
                Box::new(GzipReader::new(inner)),
                content_type,
                -1,
            ));
        }

        // Follow-up decisions upstream work from the caller's request,
        // not the rewritten network request.
        response.set_request(user_request);
        Ok(response)
    }
}

fn host_header(request: &crate::request::Request) -> String {
    let url = request.url();
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}
