//! DNS resolution seam.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Resolves hostnames to IP addresses.
///
/// The route selector queries this once per proxy candidate; every address
/// returned becomes a candidate route, tried in order.
#[async_trait]
pub trait Dns: Send + Sync {
    async fn lookup(&self, hostname: &str) -> Result<Vec<IpAddr>>;
}

/// The operating system resolver, via tokio's `lookup_host`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDns;

#[async_trait]
impl Dns for SystemDns {
    async fn lookup(&self, hostname: &str) -> Result<Vec<IpAddr>> {
        // Port is required by lookup_host but irrelevant to the answer.
        let addrs = tokio::net::lookup_host((hostname, 0))
            .await
            .map_err(|e| Error::Dns {
                host: hostname.to_string(),
                message: e.to_string(),
            })?
            .map(|sa| sa.ip())
            .collect::<Vec<_>>();
        if addrs.is_empty() {
            return Err(Error::Dns {
                host: hostname.to_string(),
                message: "no addresses".to_string(),
            });
        }
        Ok(addrs)
    }
}

/// A fixed-answer resolver, useful for tests and split-horizon setups.
#[derive(Debug, Clone)]
pub struct StaticDns {
    addresses: Arc<Vec<IpAddr>>,
}

impl StaticDns {
    pub fn new(addresses: Vec<IpAddr>) -> Self {
        Self {
            addresses: Arc::new(addresses),
        }
    }
}

#[async_trait]
impl Dns for StaticDns {
    async fn lookup(&self, hostname: &str) -> Result<Vec<IpAddr>> {
        if self.addresses.is_empty() {
            return Err(Error::Dns {
                host: hostname.to_string(),
                message: "no addresses".to_string(),
            });
        }
        Ok(self.addresses.as_ref().clone())
    }
}
