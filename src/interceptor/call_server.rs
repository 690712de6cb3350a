//! The last interceptor: drives one request/response over the exchange.

use async_trait::async_trait;

use crate::body::Body;
use crate::error::{Error, Result};
use crate::headers::{content_length, now_millis, promises_body};
use crate::request::permits_request_body;
use crate::response::{Response, ResponseHead};

use super::{Chain, Interceptor};

pub struct CallServerInterceptor;

#[async_trait]
impl Interceptor for CallServerInterceptor {
    async fn intercept(&self, chain: &mut Chain) -> Result<Response> {
        let exchange = chain
            .exchange()
            .ok_or_else(|| Error::protocol("no exchange at the call-server position"))?
            .clone();
        let request = chain.request().clone();
        let call = chain.call().clone();

        let sent_request_at = now_millis();
        if call.is_canceled() {
            exchange.cancel();
            return Err(Error::Canceled);
        }
        exchange.write_request_headers(&request).await?;

        let mut early_head: Option<ResponseHead> = None;
        if permits_request_body(request.method()) && request.body().is_some() {
            let expects_continue = request
                .header("expect")
                .is_some_and(|e| e.eq_ignore_ascii_case("100-continue"));
            let mut write_body = true;
            if expects_continue {
                // Flush headers, then let the server approve or refuse the
                // body before sending it.
                let head = exchange.read_response_headers().await?;
                if head.status == 100 {
                    write_body = true;
                } else {
                    write_body = false;
                    early_head = Some(head);
                }
            }
            if write_body {
                let body = request
                    .body()
                    .ok_or_else(|| Error::protocol("request body vanished"))?;
                exchange.write_request_body(body).await?;
            }
        }
        exchange.finish_request().await?;

        let mut head = match early_head {
            Some(head) => head,
            None => exchange.read_response_headers().await?,
        };
        // Drain interim responses (but never 101, which changes protocol).
        while (100..200).contains(&head.status) && head.status != 101 {
            head = exchange.read_response_headers().await?;
        }
        let received_response_at = now_millis();

        let status = head.status;
        let has_body = promises_body(request.method(), status, &head.headers);
        let body = if has_body {
            crate::connect::Exchange::open_response_body(&exchange, &head).await?
        } else {
            exchange.no_response_body();
            Body::empty()
        };

        let response = Response::builder()
            .request(request)
            .protocol(head.protocol)
            .status(status)
            .message(head.message)
            .headers(head.headers)
            .handshake(exchange.connection().handshake().cloned())
            .sent_request_at_millis(sent_request_at)
            .received_response_at_millis(received_response_at)
            .body(body)
            .build()?;

        if matches!(status, 204 | 205) {
            if let Some(length) = content_length(response.headers()) {
                if length > 0 {
                    let error = Error::UnexpectedResponseBody {
                        status,
                        content_length: length,
                    };
                    exchange.note_failure(&error);
                    exchange.cancel();
                    return Err(error);
                }
            }
        }

        let wants_close = response
            .header("connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
            || response
                .request()
                .header("connection")
                .is_some_and(|v| v.eq_ignore_ascii_case("close"));
        if wants_close {
            exchange.connection().no_new_exchanges();
        }

        Ok(response)
    }
}
