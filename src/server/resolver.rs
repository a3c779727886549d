//! Destination name resolution.

use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::proxy::Address;

/// Turns a requested destination into a socket address.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `addr` to the first usable socket address.
    async fn resolve(&self, addr: &Address) -> Result<SocketAddr>;
}

/// Resolver backed by the operating system (`getaddrinfo`).
#[derive(Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, addr: &Address) -> Result<SocketAddr> {
        match addr {
            Address::Socket(sa) => Ok(*sa),
            Address::Domain(host, port) => tokio::net::lookup_host((host.as_str(), *port))
                .await
                .map_err(|e| Error::TargetUnreachable(format!("{}: {}", addr, e)))?
                .next()
                .ok_or_else(|| Error::TargetUnreachable(format!("{}: no addresses", addr))),
        }
    }
}

/// Fixed host table, falling back to another resolver for unknown names.
pub struct StaticResolver<R = SystemResolver> {
    hosts: HashMap<String, SocketAddr>,
    fallback: R,
}

impl StaticResolver<SystemResolver> {
    /// Create an empty table that falls back to the system resolver.
    pub fn new() -> Self {
        Self::with_fallback(SystemResolver)
    }
}

impl Default for StaticResolver<SystemResolver> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Resolver> StaticResolver<R> {
    /// Create an empty table with a custom fallback.
    pub fn with_fallback(fallback: R) -> Self {
        Self {
            hosts: HashMap::new(),
            fallback,
        }
    }

    /// Map `host` (any port) to `target`.
    pub fn insert(mut self, host: impl Into<String>, target: SocketAddr) -> Self {
        self.hosts.insert(host.into().to_ascii_lowercase(), target);
        self
    }
}

#[async_trait]
impl<R: Resolver> Resolver for StaticResolver<R> {
    async fn resolve(&self, addr: &Address) -> Result<SocketAddr> {
        if let Address::Domain(host, _) = addr {
            if let Some(target) = self.hosts.get(&host.to_ascii_lowercase()) {
                return Ok(*target);
            }
        }
        self.fallback.resolve(addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_socket_address_passthrough() {
        let addr: SocketAddr = "127.0.0.1:80".parse().unwrap();
        assert_eq!(
            SystemResolver.resolve(&Address::Socket(addr)).await.unwrap(),
            addr
        );
    }

    #[tokio::test]
    async fn test_static_table_and_fallback() {
        let stub: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let resolver = StaticResolver::new().insert("Echo.Test", stub);

        let hit = resolver
            .resolve(&Address::Domain("echo.test".into(), 9))
            .await
            .unwrap();
        assert_eq!(hit, stub);

        let literal: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(
            resolver.resolve(&Address::Socket(literal)).await.unwrap(),
            literal
        );
    }
}
