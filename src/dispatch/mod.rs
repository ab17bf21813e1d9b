//! The config-sync ("dispatch") sub-protocol.
//!
//! A front end keeps a cached description of this node's virtual hosts,
//! applications and cluster topology, and revalidates it with a single
//! synchronous exchange: it sends the host name it cares about plus the
//! ETag it last saw, and gets back either NO_CHANGE or a fresh
//! serialization ending in a new ETag. Bodies and flow control play no
//! part here.
//!
//! Response algorithm for a query:
//!
//! 1. unresolvable host → just a `check-interval` policy hint;
//! 2. resolved but inactive → UNAVAILABLE;
//! 3. supplied ETag still valid → NO_CHANGE;
//! 4. otherwise global policy fields, the canonical host name, the cluster
//!    descriptor and every web app, with a checksum folded along the way
//!    that becomes the new ETag.

pub mod topology;

mod etag;

pub use etag::{alias_etag, EtagDigest};
pub use topology::{
    EtagCache, HostDescriptor, HostRegistry, MemberServer, MemberTiming, PodDescriptor,
    StaticHostRegistry, TopologyDescriptor, WebAppDescriptor,
};

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::protocol::{opcode, Connection};

/// Server-wide policy fields sent with every full dispatch response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchPolicy {
    /// How often the front end should re-check an unresolvable host.
    pub check_interval: Duration,
    pub session_cookie: String,
    pub ssl_session_cookie: String,
    pub session_url_prefix: String,
    pub alt_session_url_prefix: String,
    pub connection_error_page: Option<String>,
    /// Build identifier folded into every ETag, so upgrading the backend
    /// invalidates all cached configurations at once.
    pub server_version: String,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(2),
            session_cookie: "JSESSIONID".into(),
            ssl_session_cookie: "SSLJSESSIONID".into(),
            session_url_prefix: ";jsessionid=".into(),
            alt_session_url_prefix: String::new(),
            connection_error_page: None,
            server_version: concat!("hmux/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

/// The dispatch sub-protocol service. One instance per node; owns the
/// per-host ETag cache.
pub struct DispatchService {
    policy: DispatchPolicy,
    hosts: Arc<dyn HostRegistry>,
    etags: EtagCache,
}

/// Write to the wire, or fold silently when warming the ETag cache.
fn put(out: &mut Option<&mut Connection>, code: u8, value: &str) -> Result<()> {
    if let Some(conn) = out.as_deref_mut() {
        conn.write_text(code, value)?;
    }
    Ok(())
}

fn put_pair(out: &mut Option<&mut Connection>, key: &str, value: &str) -> Result<()> {
    put(out, opcode::HEADER, key)?;
    put(out, opcode::STRING, value)
}

fn secs(d: Duration) -> String {
    d.as_secs().to_string()
}

/// The default host transmits as the empty string.
fn wire_name(canonical: &str) -> &str {
    if canonical == "default" {
        ""
    } else {
        canonical
    }
}

impl DispatchService {
    pub fn new(policy: DispatchPolicy, hosts: Arc<dyn HostRegistry>) -> Self {
        Self {
            policy,
            hosts,
            etags: EtagCache::new(),
        }
    }

    /// Drive one dispatch exchange. Returns whether the connection may be
    /// kept alive afterwards.
    pub async fn handle(&self, conn: &mut Connection) -> Result<bool> {
        let mut host_name = String::new();
        let mut etag: Option<String> = None;

        loop {
            conn.flush().await?;

            let Some(code) = conn.read_opcode().await? else {
                debug!("dispatch: end of stream");
                return Ok(false);
            };

            match code {
                opcode::QUIT => {
                    debug!("dispatch: end of request");
                    return Ok(true);
                }
                opcode::EXIT => {
                    debug!("dispatch: end of socket");
                    return Ok(false);
                }
                opcode::CHANNEL => {
                    conn.read_channel().await?;
                }
                opcode::DISPATCH_ETAG => {
                    etag = Some(conn.read_text().await?);
                }
                opcode::DISPATCH_HOST => {
                    host_name = conn.read_text().await?;
                }
                opcode::DISPATCH_QUERY_ALL => {
                    let uri = conn.read_text().await?;
                    debug!(host = %host_name, uri = %uri, "dispatch query");
                    self.query_all(conn, &host_name, &uri, etag.as_deref())?;
                }
                _ => {
                    conn.skip_field().await?;
                }
            }
        }
    }

    /// Answer one QUERY_ALL. All output is buffered; the exchange loop
    /// flushes before its next read.
    fn query_all(
        &self,
        conn: &mut Connection,
        host_name: &str,
        uri: &str,
        etag: Option<&str>,
    ) -> Result<()> {
        conn.write_channel(2);

        let Some(host) = self.hosts.lookup(host_name, 80) else {
            // Not an error; the hint tells the front end when to retry.
            debug!(host = %host_name, "dispatch: host not configured");
            let mut out = Some(conn);
            return put_pair(&mut out, "check-interval", &secs(self.policy.check_interval));
        };

        if !host.active {
            debug!(host = %host.canonical_name, "dispatch: host not active");
            return conn.write_text(opcode::DISPATCH_UNAVAILABLE, "");
        }

        if self.etags.get(&host.canonical_name).is_none() {
            // First query since startup: warm the cache so a supplied ETag
            // has something to compare against.
            self.send_query(&mut None, &host, host_name, uri)?;
        }

        let canonical = wire_name(&host.canonical_name);
        let cached = self.etags.get(&host.canonical_name);
        let is_alias = host_name != canonical;

        if let Some(supplied) = etag {
            let alias_ok = is_alias && supplied == alias_etag(&host.canonical_name);
            if Some(supplied) == cached.as_deref() || alias_ok {
                debug!(host = %host.canonical_name, "dispatch: no change");
                return conn.write_text(opcode::DISPATCH_NO_CHANGE, "");
            }
            debug!(host = %host.canonical_name, "dispatch: changed");
        }

        self.send_query(&mut Some(conn), &host, host_name, uri)
    }

    /// Serialize the host configuration, folding the checksum as it goes.
    /// With no output connection this only (re)computes the cached ETag.
    fn send_query(
        &self,
        out: &mut Option<&mut Connection>,
        host: &HostDescriptor,
        queried: &str,
        uri: &str,
    ) -> Result<()> {
        let mut digest = EtagDigest::new();
        digest.update(&self.policy.server_version);

        self.write_policy(out)?;

        let canonical = wire_name(&host.canonical_name);
        put(out, opcode::DISPATCH_HOST, canonical)?;

        if queried == canonical {
            self.write_cluster(out, host, &mut digest)?;

            self.hosts.touch(host, uri);

            for app in &host.web_apps {
                if app.parent_dynamic {
                    continue;
                }

                put(out, opcode::DISPATCH_WEB_APP, &app.context_path)?;
                digest.update(&app.context_path);

                if app.dynamic_deploy {
                    put(out, opcode::DISPATCH_MATCH, "/*")?;
                    digest.update("/*");
                } else if !app.active {
                    put(out, opcode::DISPATCH_WEB_APP_UNAVAILABLE, "")?;
                } else {
                    for pattern in &app.match_patterns {
                        put(out, opcode::DISPATCH_MATCH, pattern)?;
                        digest.update(pattern);
                    }
                    for pattern in &app.ignore_patterns {
                        put(out, opcode::DISPATCH_IGNORE, pattern)?;
                        digest.update_ignore(pattern);
                    }
                }
            }

            let etag = digest.finish();
            self.etags.store(&host.canonical_name, &etag);
            put(out, opcode::DISPATCH_ETAG, &etag)?;
        } else {
            // Aliased hosts use the host name as the ETag, nothing cached.
            put(out, opcode::DISPATCH_ETAG, &alias_etag(&host.canonical_name))?;
        }

        Ok(())
    }

    /// Global policy fields, always sent with a full response.
    fn write_policy(&self, out: &mut Option<&mut Connection>) -> Result<()> {
        put_pair(out, "check-interval", &secs(self.policy.check_interval))?;
        put_pair(out, "cookie", &self.policy.session_cookie)?;
        put_pair(out, "ssl-cookie", &self.policy.ssl_session_cookie)?;
        put_pair(out, "session-url-prefix", &self.policy.session_url_prefix)?;
        put_pair(
            out,
            "alt-session-url-prefix",
            &self.policy.alt_session_url_prefix,
        )?;
        if let Some(page) = &self.policy.connection_error_page {
            put_pair(out, "connection-error-page", page)?;
        }
        Ok(())
    }

    /// Cluster id, timing parameters of the first member, then every
    /// member endpoint of the primary pod.
    fn write_cluster(
        &self,
        out: &mut Option<&mut Connection>,
        host: &HostDescriptor,
        digest: &mut EtagDigest,
    ) -> Result<()> {
        let Some(cluster) = &host.cluster else {
            return Ok(());
        };

        put(out, opcode::DISPATCH_CLUSTER, &cluster.cluster_id)?;
        digest.update(&cluster.cluster_id);

        let servers = cluster.primary_servers();

        if let Some(first) = servers.first() {
            put_pair(out, "live-time", &secs(first.timing.idle))?;
            put_pair(out, "dead-time", &secs(first.timing.recover))?;
            put_pair(out, "read-timeout", &secs(first.timing.socket))?;
            put_pair(out, "connect-timeout", &secs(first.timing.connect))?;
        }

        for server in servers {
            let endpoint = server.endpoint();
            let code = if server.tls {
                opcode::DISPATCH_SRUN_SSL
            } else {
                opcode::DISPATCH_SRUN
            };
            put(out, code, &endpoint)?;
            digest.update(&endpoint);
        }

        Ok(())
    }
}
