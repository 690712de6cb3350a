//! Opens an exchange for the request and exposes it to the rest of the
//! chain.

use async_trait::async_trait;

use crate::error::Result;
use crate::response::Response;

use super::{Chain, Interceptor};

pub struct ConnectInterceptor;

#[async_trait]
impl Interceptor for ConnectInterceptor {
    async fn intercept(&self, chain: &mut Chain) -> Result<Response> {
        let request = chain.request().clone();
        let exchange = crate::call::RealCall::init_exchange(chain.call(), &request).await?;
        chain.set_exchange(exchange);
        chain.proceed(request).await
    }
}
