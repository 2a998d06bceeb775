use std::net::IpAddr;

use eyre::WrapErr as _;

/// Read-only name resolution, used to check a domain points somewhere before probing it.
#[allow(async_fn_in_trait)]
pub trait Resolver {
    /// Returns the addresses `domain` resolves to.
    ///
    /// A name without records may come back as an error or as an empty list; callers treat
    /// both as "does not resolve".
    async fn resolve(&self, domain: &str) -> eyre::Result<Vec<IpAddr>>;
}

/// Resolves through the operating system's resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    async fn resolve(&self, domain: &str) -> eyre::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((domain, 80))
            .await
            .wrap_err_with(|| format!("resolve {domain}"))?;

        let mut ips = addrs.map(|addr| addr.ip()).collect::<Vec<_>>();
        ips.dedup();
        Ok(ips)
    }
}
