//! Read-only topology snapshot the dispatch service serializes.
//!
//! The engine does not discover any of this: cluster membership, virtual
//! hosts and web apps are supplied by an external registry and treated as
//! immutable data. The only mutable piece is the per-host ETag cache,
//! owned by the dispatch service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Load-balance timing parameters of a member server, reported to the
/// front end in whole seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberTiming {
    /// How long an idle backend connection stays usable.
    pub idle: Duration,
    /// Back-off after a member is marked dead.
    pub recover: Duration,
    /// Socket read timeout for proxied requests.
    pub socket: Duration,
    /// Connect timeout for new backend connections.
    pub connect: Duration,
}

impl Default for MemberTiming {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(10),
            recover: Duration::from_secs(15),
            socket: Duration::from_secs(65),
            connect: Duration::from_secs(5),
        }
    }
}

/// One backend worker endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberServer {
    pub address: String,
    pub port: u16,
    /// Whether the front end should use TLS to reach it.
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub timing: MemberTiming,
}

impl MemberServer {
    /// The `address:port` form used on the wire and in the ETag fold.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// A group of member servers scheduled together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodDescriptor {
    pub servers: Vec<MemberServer>,
}

/// Cluster topology for one virtual host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyDescriptor {
    pub cluster_id: String,
    pub pods: Vec<PodDescriptor>,
}

impl TopologyDescriptor {
    /// Members the front end is told about: the first pod's servers.
    pub fn primary_servers(&self) -> &[MemberServer] {
        self.pods.first().map(|p| p.servers.as_slice()).unwrap_or(&[])
    }
}

/// One deployed web application under a host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebAppDescriptor {
    pub context_path: String,
    /// Inactive apps are reported as unavailable, not omitted.
    pub active: bool,
    /// Dynamically deployed apps match everything under their context.
    #[serde(default)]
    pub dynamic_deploy: bool,
    /// Children of a dynamic-deployment template are skipped entirely;
    /// their template's wildcard already covers them.
    #[serde(default)]
    pub parent_dynamic: bool,
    #[serde(default)]
    pub match_patterns: Vec<String>,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
}

/// One virtual host with its cluster and applications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostDescriptor {
    /// Canonical name; aliases resolve to this descriptor.
    pub canonical_name: String,
    pub active: bool,
    #[serde(default)]
    pub cluster: Option<TopologyDescriptor>,
    #[serde(default)]
    pub web_apps: Vec<WebAppDescriptor>,
}

/// External host resolution. Alias names must resolve to the canonical
/// descriptor; unresolvable names return `None`.
pub trait HostRegistry: Send + Sync {
    fn lookup(&self, name: &str, port: u16) -> Option<Arc<HostDescriptor>>;

    /// Called with the queried URI before the web-app list is serialized,
    /// so a dynamic-deployment controller can start the matching app.
    fn touch(&self, _host: &HostDescriptor, _uri: &str) {}
}

/// Map-backed registry for embedders with a fixed host set, and for tests.
#[derive(Default)]
pub struct StaticHostRegistry {
    hosts: HashMap<String, Arc<HostDescriptor>>,
}

impl StaticHostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host under its canonical name.
    pub fn insert(&mut self, host: HostDescriptor) {
        self.hosts
            .insert(host.canonical_name.to_ascii_lowercase(), Arc::new(host));
    }

    /// Register an alias for an already-registered canonical name.
    pub fn alias(&mut self, alias: &str, canonical: &str) {
        if let Some(host) = self.hosts.get(&canonical.to_ascii_lowercase()).cloned() {
            self.hosts.insert(alias.to_ascii_lowercase(), host);
        }
    }
}

impl HostRegistry for StaticHostRegistry {
    fn lookup(&self, name: &str, _port: u16) -> Option<Arc<HostDescriptor>> {
        self.hosts.get(&name.to_ascii_lowercase()).cloned()
    }
}

/// Per-host cached ETag strings, keyed by canonical host name. Entries
/// never expire on their own; recomputation replaces them.
#[derive(Default)]
pub struct EtagCache {
    map: Mutex<HashMap<String, String>>,
}

impl EtagCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, canonical: &str) -> Option<String> {
        self.map.lock().get(canonical).cloned()
    }

    pub fn store(&self, canonical: &str, etag: &str) {
        self.map
            .lock()
            .insert(canonical.to_string(), etag.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(name: &str) -> HostDescriptor {
        HostDescriptor {
            canonical_name: name.to_string(),
            active: true,
            cluster: None,
            web_apps: Vec::new(),
        }
    }

    #[test]
    fn test_static_registry_alias_resolves_to_canonical() {
        let mut reg = StaticHostRegistry::new();
        reg.insert(host("www.example.com"));
        reg.alias("example.com", "www.example.com");

        let resolved = reg.lookup("example.com", 80).unwrap();
        assert_eq!(resolved.canonical_name, "www.example.com");
        assert!(reg.lookup("missing.example.com", 80).is_none());
    }

    #[test]
    fn test_etag_cache_replace() {
        let cache = EtagCache::new();
        assert_eq!(cache.get("a"), None);
        cache.store("a", "one");
        cache.store("a", "two");
        assert_eq!(cache.get("a").as_deref(), Some("two"));
    }

    #[test]
    fn test_primary_servers_first_pod_only() {
        let topo = TopologyDescriptor {
            cluster_id: "app-tier".into(),
            pods: vec![
                PodDescriptor {
                    servers: vec![MemberServer {
                        address: "10.0.0.1".into(),
                        port: 6800,
                        tls: false,
                        timing: MemberTiming::default(),
                    }],
                },
                PodDescriptor {
                    servers: vec![MemberServer {
                        address: "10.0.1.1".into(),
                        port: 6800,
                        tls: false,
                        timing: MemberTiming::default(),
                    }],
                },
            ],
        };
        assert_eq!(topo.primary_servers().len(), 1);
        assert_eq!(topo.primary_servers()[0].endpoint(), "10.0.0.1:6800");
    }
}
