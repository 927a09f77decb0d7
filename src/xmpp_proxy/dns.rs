//! Upstream XMPP server resolution.
//!
//! Turns the domain announced in the browser's stream header into the list of
//! TCP endpoints to try, in order. A configured `upstream` wins outright;
//! otherwise `_xmpp-client._tcp.<domain>` SRV records are consulted (RFC 6120
//! section 3.2.1) before falling back to `<domain>:<upstream_port>`.

use tracing::{info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::config::Config;

fn elapsed_ms(start: std::time::Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// A TCP endpoint to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamEndpoint {
    pub host: String,
    pub port: u16,
}

impl UpstreamEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// How the endpoints for a domain are found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamPlan {
    /// Connect here, no lookup.
    Direct(UpstreamEndpoint),
    /// SRV lookup for the domain, then the fallback port.
    Srv { domain: String, fallback_port: u16 },
}

/// Decide how to reach `domain` under `config`.
pub fn plan_upstream(domain: &str, config: &Config) -> UpstreamPlan {
    if let Some((host, port)) = config.upstream_override() {
        return UpstreamPlan::Direct(UpstreamEndpoint::new(host, port));
    }
    let domain = domain.trim().trim_end_matches('.');
    if !config.resolve_srv || domain.parse::<std::net::IpAddr>().is_ok() {
        return UpstreamPlan::Direct(UpstreamEndpoint::new(domain, config.upstream_port));
    }
    UpstreamPlan::Srv {
        domain: domain.to_string(),
        fallback_port: config.upstream_port,
    }
}

/// One SRV answer, before ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvCandidate {
    pub priority: u16,
    pub weight: u16,
    pub target: String,
    pub port: u16,
}

/// Order SRV answers by priority ascending (lower = preferred), then weight
/// descending. A target of "." means the service is not offered there and
/// is skipped (RFC 2782).
pub fn order_candidates(mut records: Vec<SrvCandidate>) -> Vec<UpstreamEndpoint> {
    records.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));
    records
        .into_iter()
        .filter_map(|r| {
            let target = r.target.trim_end_matches('.');
            (!target.is_empty()).then(|| UpstreamEndpoint::new(target, r.port))
        })
        .collect()
}

/// Resolve the endpoints for `domain`, in connection-attempt order. Never
/// empty: the fallback endpoint is returned when no SRV record is usable.
pub async fn resolve_upstream(domain: &str, config: &Config) -> Vec<UpstreamEndpoint> {
    let (domain, fallback_port) = match plan_upstream(domain, config) {
        UpstreamPlan::Direct(endpoint) => {
            info!(host = %endpoint.host, port = endpoint.port, "Using direct upstream endpoint");
            return vec![endpoint];
        }
        UpstreamPlan::Srv {
            domain,
            fallback_port,
        } => (domain, fallback_port),
    };

    let resolve_started = std::time::Instant::now();
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => r,
        Err(e) => {
            warn!(
                "Failed to load system DNS config: {}, falling back to default resolver",
                e
            );
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let srv_name = format!("_xmpp-client._tcp.{}", domain);
    let lookup_started = std::time::Instant::now();
    let endpoints = match resolver.srv_lookup(srv_name.as_str()).await {
        Ok(lookup) => {
            let candidates = lookup
                .iter()
                .map(|r| SrvCandidate {
                    priority: r.priority(),
                    weight: r.weight(),
                    target: r.target().to_string(),
                    port: r.port(),
                })
                .collect();
            let endpoints = order_candidates(candidates);
            info!(
                domain = %domain,
                count = endpoints.len(),
                lookup_ms = elapsed_ms(lookup_started),
                "SRV resolved"
            );
            endpoints
        }
        Err(e) => {
            info!(
                domain = %domain,
                srv = %srv_name,
                lookup_ms = elapsed_ms(lookup_started),
                error = %e,
                "SRV lookup failed"
            );
            Vec::new()
        }
    };

    if endpoints.is_empty() {
        warn!(
            domain = %domain,
            resolve_total_ms = elapsed_ms(resolve_started),
            "No SRV records found, using fallback: {}:{}",
            domain,
            fallback_port
        );
        return vec![UpstreamEndpoint::new(domain, fallback_port)];
    }
    endpoints
}
