use std::net::IpAddr;

use async_trait::async_trait;

use crate::error::Result;

/// Resolves a hostname to a list of candidate addresses. Callers pick the
/// first usable address; no caching policy is imposed here.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Resolves via the OS stub resolver through `tokio::net::lookup_host`.
pub struct SystemResolver;

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs: Vec<IpAddr> = tokio::net::lookup_host(format!("{host}:0"))
            .await?
            .map(|a| a.ip())
            .collect();
        if addrs.is_empty() {
            return Err(crate::error::Error::Dial(format!(
                "no addresses resolved for {host}"
            )));
        }
        Ok(addrs)
    }
}
