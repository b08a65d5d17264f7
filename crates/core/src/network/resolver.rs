//! DNS over a specific attachment
//!
//! Queries go to the handle's own DNS servers and leave from the handle's
//! source address, so lookups follow the same radio as the traffic.

use super::{HandleId, NetworkHandle};
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use mobileproxy_common::ProxyError;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DNS_PORT: u16 = 53;
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Keeps one resolver for the most recent handle
#[derive(Default)]
pub(super) struct ResolverCache {
    current: Mutex<Option<(HandleId, Vec<IpAddr>, Arc<TokioAsyncResolver>)>>,
}

impl ResolverCache {
    pub(super) async fn lookup(
        &self,
        handle: &NetworkHandle,
        host: &str,
    ) -> Result<Vec<IpAddr>, ProxyError> {
        let resolver = self.resolver_for(handle);
        let lookup = resolver
            .lookup_ip(host)
            .await
            .map_err(|e| ProxyError::dns(format!("{}: {}", host, e)))?;
        Ok(lookup.iter().collect())
    }

    fn resolver_for(&self, handle: &NetworkHandle) -> Arc<TokioAsyncResolver> {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some((id, servers, resolver)) = current.as_ref() {
            if *id == handle.id && *servers == handle.dns_servers {
                return resolver.clone();
            }
        }

        let resolver = Arc::new(build_resolver(&handle.dns_servers, handle.local_addr));
        *current = Some((handle.id, handle.dns_servers.clone(), resolver.clone()));
        resolver
    }
}

fn build_resolver(servers: &[IpAddr], source: Option<IpAddr>) -> TokioAsyncResolver {
    let mut config = ResolverConfig::new();
    for server in servers {
        let mut name_server = NameServerConfig::new(SocketAddr::new(*server, DNS_PORT), Protocol::Udp);
        // Source binding only works within the same address family
        name_server.bind_addr = source
            .filter(|src| src.is_ipv4() == server.is_ipv4())
            .map(|src| SocketAddr::new(src, 0));
        config.add_name_server(name_server);
    }

    let mut opts = ResolverOpts::default();
    opts.timeout = QUERY_TIMEOUT;
    opts.attempts = 2;

    TokioAsyncResolver::tokio(config, opts)
}
