//! Host header parsing and subdomain derivation.

use std::fmt;

use anyhow::{Result, anyhow};

/// A host and port pair, as used for both the tunnel target and the
/// rendezvous server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    /// Scheme to use when replaying requests against this host.
    pub fn http_scheme(&self) -> &'static str {
        if self.port == 443 { "https" } else { "http" }
    }

    /// Scheme to use when dialing this host over WebSocket.
    pub fn ws_scheme(&self) -> &'static str {
        if self.port == 443 { "wss" } else { "ws" }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Splits a `host:port` string, tolerating an `http://` or `https://` prefix
/// and a trailing slash.
pub fn split_host_port(input: &str) -> Result<HostPort> {
    let trimmed = input
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/');

    let (host, port) = trimmed
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing port in address: {input}"))?;
    if host.is_empty() {
        return Err(anyhow!("missing host in address: {input}"));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow!("invalid port in address: {input}"))?;

    Ok(HostPort {
        host: host.to_string(),
        port,
    })
}

/// Routing key for a public request, derived from its Host header.
///
/// Ordinarily this is the label before the first dot. Loopback hosts keep
/// the whole `host:port` string so that local development works without DNS;
/// the auth gate recognizes the same hosts and skips the identity match.
pub fn subdomain_from_host(host: &str) -> String {
    if is_local_host(host) {
        return host.to_ascii_lowercase();
    }
    host.split('.')
        .next()
        .unwrap_or(host)
        .to_ascii_lowercase()
}

/// True for `localhost:<port>` and `127.0.0.1:<port>` hosts.
///
/// Deliberately not generalized to other private address ranges.
pub fn is_local_host(host: &str) -> bool {
    host.starts_with("localhost:") || host.starts_with("127.0.0.1:")
}
