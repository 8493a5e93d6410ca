//! Providers: lazy, single-pass sequences of contexts (spec §4.8).

use std::time::Duration;

use ipnetwork::Ipv4Network;

use crate::{
    context::{Context, SshAuth},
    error::{CrewError, Result},
};

/// A lazy, single-pass sequence of contexts that may require scoped
/// acquisition around the whole sequence (e.g. SSH tunnels).
pub trait Provider: Send {
    /// Materialises the full context sequence for one executor run. Scoped
    /// acquisition (tunnels opened before, closed after) is handled by the
    /// provider's own `acquire`/`release`.
    fn contexts(&self) -> Result<Vec<Context>>;

    /// Called once before the executor consumes the sequence.
    fn acquire(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called once after the executor has drained the sequence, in reverse
    /// of any nested acquisition order.
    fn release(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Yields the process-wide Local context exactly once.
pub struct LocalProvider;

impl Provider for LocalProvider {
    fn contexts(&self) -> Result<Vec<Context>> {
        Ok(vec![Context::local()])
    }
}

/// One SSH tunnel hop definition.
#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub host: String,
    pub port: u16,
    pub auth: SshAuth,
}

/// SSH fan-out: a list of hosts (literal, CIDR, or a `a.b.c.start-end` last
/// octet range), an optional shared auth, and an ordered tunnel chain.
///
/// Host-range parsing does not silently fall back to the literal string on
/// failure; malformed ranges are a hard error propagated through
/// `Provider::contexts`, not swallowed at the call site.
pub struct SshProvider {
    pub hosts: Vec<String>,
    pub auth: SshAuth,
    pub port: u16,
    pub connect_timeout: Duration,
    pub tunnels: Vec<TunnelSpec>,
    tunnel_contexts: Vec<Context>,
}

impl SshProvider {
    pub fn new(hosts: Vec<String>, auth: SshAuth) -> Self {
        Self {
            hosts,
            auth,
            port: 22,
            connect_timeout: Duration::from_secs(1),
            tunnels: Vec::new(),
            tunnel_contexts: Vec::new(),
        }
    }

    fn expanded_hosts(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in &self.hosts {
            out.extend(expand_host_entry(entry)?);
        }
        Ok(out)
    }

    fn innermost(&self) -> Context {
        self.tunnel_contexts.last().cloned().unwrap_or_else(Context::local)
    }
}

/// Parses one host entry as a bare literal, a CIDR block, or an explicit
/// `a.b.c.start-end` last-octet range. Anything malformed is a hard error
/// rather than a silent fallback to the literal string.
fn expand_host_entry(entry: &str) -> Result<Vec<String>> {
    if let Some((prefix, range)) = entry.rsplit_once('.') {
        if let Some((start, end)) = range.split_once('-') {
            let start: u8 = start.parse().map_err(|_| {
                CrewError::ArgumentTypeMismatch {
                    name: "host".into(),
                    expected: "a.b.c.start-end range".into(),
                    value: entry.to_owned(),
                }
            })?;
            let end: u8 = end.parse().map_err(|_| CrewError::ArgumentTypeMismatch {
                name: "host".into(),
                expected: "a.b.c.start-end range".into(),
                value: entry.to_owned(),
            })?;
            if start > end {
                return Err(CrewError::ArgumentTypeMismatch {
                    name: "host".into(),
                    expected: "start <= end".into(),
                    value: entry.to_owned(),
                });
            }
            return Ok((start..=end).map(|octet| format!("{prefix}.{octet}")).collect());
        }
    }
    if entry.contains('/') {
        let network: Ipv4Network = entry.parse().map_err(|_| CrewError::ArgumentTypeMismatch {
            name: "host".into(),
            expected: "CIDR block".into(),
            value: entry.to_owned(),
        })?;
        return Ok(network.iter().map(|ip| ip.to_string()).collect());
    }
    Ok(vec![entry.to_owned()])
}

impl Provider for SshProvider {
    fn contexts(&self) -> Result<Vec<Context>> {
        let parent = self.innermost();
        Ok(self
            .expanded_hosts()?
            .into_iter()
            .map(|host| {
                parent.ssh_context_with(
                    host,
                    self.port,
                    self.auth.clone(),
                    self.connect_timeout,
                    None,
                )
            })
            .collect())
    }

    fn acquire(&mut self) -> Result<()> {
        // tunnels open in declaration order, each through the previous hop
        let mut parent = Context::local();
        for tunnel in &self.tunnels {
            let ctx = parent.ssh_context_with(
                tunnel.host.clone(),
                tunnel.port,
                tunnel.auth.clone(),
                self.connect_timeout,
                Some(parent.clone()),
            );
            self.tunnel_contexts.push(ctx.clone());
            parent = ctx;
        }
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        // closed in reverse order
        self.tunnel_contexts.clear();
        Ok(())
    }
}

/// Docker fan-out: one context per container id.
pub struct DockerProvider {
    pub container_ids: Vec<String>,
}

impl DockerProvider {
    pub fn new(container_ids: Vec<String>) -> Self {
        Self { container_ids }
    }
}

impl Provider for DockerProvider {
    fn contexts(&self) -> Result<Vec<Context>> {
        let local = Context::local();
        Ok(self.container_ids.iter().map(|id| local.docker_context(id.clone())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_last_octet_range() {
        let hosts = expand_host_entry("10.0.0.1-3").unwrap();
        assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    fn malformed_range_is_a_hard_error() {
        assert!(expand_host_entry("10.0.0.abc-def").is_err());
    }

    #[test]
    fn bare_literal_passes_through() {
        assert_eq!(expand_host_entry("example.com").unwrap(), vec!["example.com"]);
    }

    #[test]
    fn local_provider_yields_once() {
        let provider = LocalProvider;
        assert_eq!(provider.contexts().unwrap().len(), 1);
    }

    #[test]
    fn ssh_provider_propagates_a_malformed_host_range() {
        let provider = SshProvider::new(
            vec!["10.0.0.abc-def".to_owned()],
            SshAuth {
                user: "root".into(),
                password: None,
                private_key: None,
            },
        );
        assert!(provider.contexts().is_err());
    }
}
