// Outbound destination policy for callback URLs

//! # SSRF Guard
//!
//! Every callback sequence starts with `SsrfGuard::validate`. The scheme, host
//! and resolution checks apply in every environment; address and hostname
//! blocking applies in production only, so development callbacks can reach
//! local test receivers.
//!
//! Resolution goes through the `HostResolver` trait. `SystemResolver` uses the
//! operating system; tests swap in a fixed table. An allowed verdict carries
//! the addresses that were checked, and delivery connects only to those, so a
//! second lookup cannot swap in an internal address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use url::{Host, Url};

use crate::config::Environment;
use crate::{Result, ServiceError};

/// Hostnames that always point inside the platform
const METADATA_HOSTS: [&str; 2] = ["metadata.google.internal", "metadata.azure.com"];

/// Where an allowed delivery may connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VettedDestination {
    /// Hostname to pin, `None` when the URL holds an IP literal
    pub host: Option<String>,
    pub addrs: Vec<SocketAddr>,
}

/// Outcome of a destination check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SsrfVerdict {
    Allowed(VettedDestination),
    Rejected(String),
}

impl SsrfVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }
}

/// Resolves a hostname to the addresses a connection could reach
#[async_trait::async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system (`getaddrinfo`)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait::async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// Validates callback destinations before any attempt is made
#[derive(Clone)]
pub struct SsrfGuard {
    environment: Environment,
    resolver: Arc<dyn HostResolver>,
}

impl SsrfGuard {
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            resolver: Arc::new(SystemResolver),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Syntax-only check used when a request is accepted.
    ///
    /// ## Errors
    /// `ServiceError::InvalidCallbackUrl` when the URL does not parse, is not
    /// http(s) or has no host.
    pub fn check_syntax(url: &str) -> Result<Url> {
        let parsed = Url::parse(url)
            .map_err(|e| ServiceError::InvalidCallbackUrl(format!("invalid URL format: {e}")))?;

        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(ServiceError::InvalidCallbackUrl(format!(
                    "unsupported URL scheme: {scheme}"
                )))
            }
        }

        if parsed.host().is_none() {
            return Err(ServiceError::InvalidCallbackUrl(
                "URL must have a host".to_string(),
            ));
        }

        Ok(parsed)
    }

    /// Decide whether a delivery to `url` may be attempted at all
    pub async fn validate(&self, url: &str) -> SsrfVerdict {
        let parsed = match Self::check_syntax(url) {
            Ok(parsed) => parsed,
            Err(ServiceError::InvalidCallbackUrl(reason)) => return SsrfVerdict::Rejected(reason),
            Err(other) => return SsrfVerdict::Rejected(other.to_string()),
        };
        let production = self.environment.is_production();
        let port = parsed.port_or_known_default().unwrap_or(80);

        let (host, addresses) = match parsed.host() {
            Some(Host::Ipv4(v4)) => (None, vec![IpAddr::V4(v4)]),
            Some(Host::Ipv6(v6)) => (None, vec![IpAddr::V6(v6)]),
            Some(Host::Domain(raw)) => {
                let domain = raw.trim_end_matches('.').to_ascii_lowercase();
                if production && is_internal_hostname(&domain) {
                    return SsrfVerdict::Rejected(format!(
                        "{domain} is a restricted internal hostname"
                    ));
                }

                match self.resolver.resolve(&domain, port).await {
                    Ok(addrs) if !addrs.is_empty() => (Some(raw.to_string()), addrs),
                    Ok(_) => {
                        return SsrfVerdict::Rejected(format!("{domain} did not resolve"));
                    }
                    Err(e) => {
                        return SsrfVerdict::Rejected(format!("{domain} did not resolve: {e}"));
                    }
                }
            }
            None => return SsrfVerdict::Rejected("URL must have a host".to_string()),
        };

        if production {
            if let Some(ip) = addresses.iter().find(|ip| is_internal_ip(ip)) {
                return SsrfVerdict::Rejected(format!("{ip} is a private or internal address"));
            }
        }

        SsrfVerdict::Allowed(VettedDestination {
            host,
            addrs: addresses
                .into_iter()
                .map(|ip| SocketAddr::new(ip, port))
                .collect(),
        })
    }
}

fn is_internal_hostname(host: &str) -> bool {
    host == "localhost"
        || host.ends_with(".localhost")
        || host.ends_with(".internal")
        || host.ends_with(".local")
        || METADATA_HOSTS.contains(&host)
}

/// Loopback, private, link-local, CGNAT, unspecified and broadcast ranges
pub fn is_internal_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_internal_ipv4(v4),
        IpAddr::V6(v6) => is_internal_ipv6(v6),
    }
}

fn is_internal_ipv4(v4: &Ipv4Addr) -> bool {
    let octets = v4.octets();
    v4.is_loopback()                // 127.0.0.0/8
        || v4.is_private()          // 10/8, 172.16/12, 192.168/16
        || v4.is_link_local()       // 169.254/16, includes the metadata endpoint
        || v4.is_broadcast()
        || v4.is_unspecified()
        || octets[0] == 0           // 0.0.0.0/8
        || (octets[0] == 100 && (octets[1] & 0xC0) == 64) // 100.64.0.0/10
}

fn is_internal_ipv6(v6: &Ipv6Addr) -> bool {
    if let Some(mapped) = v6.to_ipv4_mapped() {
        return is_internal_ipv4(&mapped);
    }
    let first = v6.segments()[0];
    v6.is_loopback()
        || v6.is_unspecified()
        || (first & 0xfe00) == 0xfc00 // fc00::/7, includes fd00:ec2::254
        || (first & 0xffc0) == 0xfe80 // fe80::/10
}
