//! Mapping cluster names to server endpoints.
//!
//! A cluster is named either by a comma separated list of `host:port` endpoints, which is used
//! as-is, or by a single `domain:port` which is looked up in DNS. When DNS fails, a static table
//! and then a local hosts cache file are consulted. A stale cache is rewritten from its
//! [`HostsSource`] before it is read.

use crate::{ZkError, ZkResult};
use async_trait::async_trait;
use failure::{format_err, Error};
use slog::{debug, info, o, warn, Logger};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// A resolved cluster: the name it was resolved from and the endpoints to try, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterAddress {
    pub cluster: String,
    pub hosts: Vec<String>,
}

impl ClusterAddress {
    /// Splits a comma separated endpoint list, skipping empty entries.
    pub fn from_list(cluster: &str, list: &str) -> Self {
        ClusterAddress {
            cluster: cluster.to_string(),
            hosts: list
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect(),
        }
    }

    /// The endpoints joined back into the usual connect string.
    pub fn connect_string(&self) -> String {
        self.hosts.join(",")
    }
}

/// Something that can turn a cluster name into endpoints.
#[async_trait]
pub trait Resolve: Send + Sync + 'static {
    /// Resolves `cluster`, failing with `DnsFailure` if no endpoint can be found.
    async fn resolve(&self, cluster: &str) -> ZkResult<ClusterAddress>;
}

/// Resolves clusters from a fixed table. Names missing from the table fall back to being
/// treated as endpoint lists.
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    table: HashMap<String, String>,
}

impl StaticResolver {
    pub fn new() -> Self {
        StaticResolver::default()
    }

    /// Maps `cluster` to a comma separated list of endpoints.
    pub fn with(mut self, cluster: &str, hosts: &str) -> Self {
        self.table.insert(cluster.to_string(), hosts.to_string());
        self
    }
}

#[async_trait]
impl Resolve for StaticResolver {
    async fn resolve(&self, cluster: &str) -> ZkResult<ClusterAddress> {
        let list = self.table.get(cluster).map(String::as_str).unwrap_or(cluster);
        let address = ClusterAddress::from_list(cluster, list);
        if address.hosts.is_empty() {
            return Err(ZkError::DnsFailure);
        }
        Ok(address)
    }
}

/// Where the contents of a [`HostsCache`] come from.
#[async_trait]
pub trait HostsSource: Send + Sync + 'static {
    /// The whole endpoint table, in the cache file's format.
    async fn fetch(&self) -> Result<String, Error>;
}

/// The resolver used by default: endpoint lists, DNS, then the fallback sources.
#[derive(Clone)]
pub struct AddressResolver {
    fallback: HashMap<String, String>,
    hosts_cache: Option<HostsCache>,
    hosts_source: Option<(Arc<dyn HostsSource>, Duration)>,
    logger: Logger,
}

impl fmt::Debug for AddressResolver {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AddressResolver")
            .field("fallback", &self.fallback)
            .field("hosts_cache", &self.hosts_cache)
            .field("hosts_source", &self.hosts_source.is_some())
            .finish()
    }
}

impl Default for AddressResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressResolver {
    pub fn new() -> Self {
        AddressResolver {
            fallback: HashMap::new(),
            hosts_cache: None,
            hosts_source: None,
            logger: Logger::root(slog::Discard, o!()),
        }
    }

    /// Endpoints to use for `cluster` when its DNS lookup fails.
    pub fn with_static_hosts(mut self, cluster: &str, hosts: &str) -> Self {
        self.fallback.insert(cluster.to_string(), hosts.to_string());
        self
    }

    /// Consults `cache` when both DNS and the static table fail.
    pub fn with_hosts_cache(mut self, cache: HostsCache) -> Self {
        self.hosts_cache = Some(cache);
        self
    }

    /// Rewrites the hosts cache from `source` whenever it is consulted while older than
    /// `max_age`.
    pub fn with_hosts_source(mut self, source: Arc<dyn HostsSource>, max_age: Duration) -> Self {
        self.hosts_source = Some((source, max_age));
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// The hosts cache, if one is configured.
    pub fn hosts_cache(&self) -> Option<&HostsCache> {
        self.hosts_cache.as_ref()
    }

    async fn fall_back(&self, cluster: &str) -> ZkResult<ClusterAddress> {
        if let Some(list) = self.fallback.get(cluster) {
            debug!(self.logger, "using static hosts"; "cluster" => cluster);
            return Ok(ClusterAddress::from_list(cluster, list));
        }
        if let Some(ref cache) = self.hosts_cache {
            self.refresh_if_stale(cache).await;
            match cache.lookup(cluster).await {
                Ok(Some(hosts)) => {
                    debug!(self.logger, "using cached hosts"; "cluster" => cluster);
                    return Ok(ClusterAddress {
                        cluster: cluster.to_string(),
                        hosts,
                    });
                }
                Ok(None) => {
                    warn!(self.logger, "cluster not in hosts cache"; "cluster" => cluster);
                }
                Err(e) => {
                    warn!(self.logger, "failed to read hosts cache: {}", e; "cluster" => cluster);
                }
            }
        }
        Err(ZkError::DnsFailure)
    }

    /// A failed refresh leaves the old cache in place.
    async fn refresh_if_stale(&self, cache: &HostsCache) {
        let (source, max_age) = match self.hosts_source {
            Some((ref source, max_age)) => (source, max_age),
            None => return,
        };
        if !cache.is_stale(max_age).await {
            return;
        }
        let refreshed = match source.fetch().await {
            Ok(contents) => cache.store(&contents).await,
            Err(e) => Err(e),
        };
        match refreshed {
            Ok(()) => info!(self.logger, "refreshed hosts cache"; "path" => %cache.path().display()),
            Err(e) => warn!(self.logger, "failed to refresh hosts cache: {}", e),
        }
    }
}

#[async_trait]
impl Resolve for AddressResolver {
    async fn resolve(&self, cluster: &str) -> ZkResult<ClusterAddress> {
        if cluster.contains(',') {
            return Ok(ClusterAddress::from_list(cluster, cluster));
        }
        let port = match cluster.rfind(':') {
            Some(i) => &cluster[i + 1..],
            None => return Err(ZkError::DnsFailure),
        };

        match tokio::net::lookup_host(cluster).await {
            Ok(addrs) => {
                let hosts: Vec<String> = addrs
                    .map(|a| format!("{}:{}", a.ip(), port))
                    .collect();
                if !hosts.is_empty() {
                    return Ok(ClusterAddress {
                        cluster: cluster.to_string(),
                        hosts,
                    });
                }
                self.fall_back(cluster).await
            }
            Err(e) => {
                warn!(self.logger, "dns lookup failed: {}", e; "cluster" => cluster);
                self.fall_back(cluster).await
            }
        }
    }
}

/// A local file mapping cluster names to endpoints, one `cluster=host:port,host:port` line per
/// cluster. Lines are matched by prefix, so `tf.zk.oa.com` finds `tf.zk.oa.com:2181=...`.
#[derive(Clone, Debug)]
pub struct HostsCache {
    path: PathBuf,
}

impl HostsCache {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        HostsCache { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The endpoints recorded for `cluster`, or `None` if no line matches.
    ///
    /// A matching line without `=` is a format error.
    pub async fn lookup(&self, cluster: &str) -> Result<Option<Vec<String>>, Error> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        for line in contents.lines() {
            if !line.starts_with(cluster) {
                continue;
            }
            return match line.find('=') {
                Some(i) => Ok(Some(ClusterAddress::from_list(cluster, &line[i + 1..]).hosts)),
                None => Err(format_err!("invalid hosts cache line: {}", line)),
            };
        }
        Ok(None)
    }

    /// Whether the file is missing or older than `max_age`.
    pub async fn is_stale(&self, max_age: Duration) -> bool {
        let modified = match tokio::fs::metadata(&self.path)
            .await
            .and_then(|m| m.modified())
        {
            Ok(modified) => modified,
            Err(_) => return true,
        };
        match SystemTime::now().duration_since(modified) {
            Ok(age) => age >= max_age,
            // modified in the future
            Err(_) => false,
        }
    }

    /// Replaces the file's contents. Readers see either the old or the new file, never a partial
    /// one.
    pub async fn store(&self, contents: &str) -> Result<(), Error> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }
        let mut temp = self.path.clone().into_os_string();
        temp.push(format!("_{}", std::process::id()));
        let temp = PathBuf::from(temp);

        let mut contents = contents.to_string();
        if !contents.ends_with('\n') {
            contents.push('\n');
        }
        tokio::fs::write(&temp, contents).await?;
        if let Err(e) = tokio::fs::rename(&temp, &self.path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }
}
