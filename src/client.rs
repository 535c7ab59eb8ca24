//! The entry point: maps node paths to cluster sessions.
//!
//! A path like `/zk/<cluster>/rest/of/path` names the cluster in its second segment. The client
//! keeps one [`Session`] per cluster, connecting it on first use.

use crate::node::{validate_path, Node};
use crate::resolver::{AddressResolver, HostsCache, HostsSource, Resolve};
use crate::session::{Session, SessionEventHandler, SessionOptions};
use crate::transport::Connector;
use crate::{CreateMode, ZkError, ZkEvent, ZkResult};
use async_trait::async_trait;
use failure::{format_err, Error};
use slog::{debug, info, o, warn, Logger};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Appended to a cluster name to form its address.
pub const DEFAULT_CLUSTER_DOMAIN: &str = ".zk.oa.com:2181";
/// Appended to the first two characters of a cluster name to form its read-only proxy address.
pub const DEFAULT_PROXY_DOMAIN: &str = ".proxy.zk.oa.com:2181";
/// The cluster holding the endpoint table of every other cluster.
pub const ROOT_CLUSTER: &str = "tf.zk.oa.com:2181";
/// Endpoints of [`ROOT_CLUSTER`] used when its name does not resolve.
pub const DEFAULT_ROOT_HOSTS: &str = "10.168.147.208:2181,10.168.154.110:2181,10.168.147.16:2181";
/// Where on [`ROOT_CLUSTER`] the endpoint table lives.
pub const HOSTS_NODE: &str = "/zk/tf/router/zk_hosts";
/// How old the hosts cache may get before [`Client::refresh_hosts_cache`] rewrites it.
pub const HOSTS_CACHE_REFRESH: Duration = Duration::from_secs(5 * 60);

/// Cluster names starting with this are served by mock nodes.
const MOCK_CLUSTER: &str = "mock";

/// Builder that allows customizing options for [`Client`].
pub struct ClientBuilder {
    options: SessionOptions,
    cluster_domain: String,
    proxy_domain: String,
    proxy_host: Option<String>,
    resolver: Option<Arc<dyn Resolve>>,
    hosts_cache: Option<HostsCache>,
    root_hosts: String,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        ClientBuilder {
            options: SessionOptions::default(),
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
            proxy_domain: DEFAULT_PROXY_DOMAIN.to_string(),
            proxy_host: None,
            resolver: None,
            hosts_cache: None,
            root_hosts: DEFAULT_ROOT_HOSTS.to_string(),
        }
    }
}

impl ClientBuilder {
    /// Handshake timeout, also requested as the server session timeout.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.options.timeout = timeout;
        self
    }

    /// A `user:password` pair every session authenticates with.
    pub fn set_credential(&mut self, credential: &str) -> &mut Self {
        self.options.credential = credential.to_string();
        self
    }

    /// Route through the read-only proxies and refuse every change to the tree.
    pub fn set_read_only(&mut self, read_only: bool) -> &mut Self {
        self.options.read_only = read_only;
        self
    }

    pub fn set_max_retries(&mut self, max_retries: usize) -> &mut Self {
        self.options.max_retries = max_retries;
        self
    }

    pub fn set_retry_backoff(&mut self, backoff: Duration) -> &mut Self {
        self.options.retry_backoff = backoff;
        self
    }

    pub fn set_lock_poll_interval(&mut self, interval: Duration) -> &mut Self {
        self.options.lock_poll_interval = interval;
        self
    }

    pub fn set_cluster_domain(&mut self, domain: &str) -> &mut Self {
        self.cluster_domain = domain.to_string();
        self
    }

    pub fn set_proxy_domain(&mut self, domain: &str) -> &mut Self {
        self.proxy_domain = domain.to_string();
        self
    }

    /// Send all read-only traffic to `host` instead of the per-cluster proxies.
    pub fn set_proxy_host(&mut self, host: &str) -> &mut Self {
        self.proxy_host = Some(host.to_string());
        self
    }

    /// Called with the cluster name and event on every session state change.
    pub fn set_session_event_handler<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(String, ZkEvent) + Send + Sync + 'static,
    {
        let handler: SessionEventHandler = Arc::new(handler);
        self.options.event_handler = Some(handler);
        self
    }

    /// Resolve cluster names with `resolver` instead of an [`AddressResolver`].
    pub fn set_resolver(&mut self, resolver: Arc<dyn Resolve>) -> &mut Self {
        self.resolver = Some(resolver);
        self
    }

    /// The hosts cache used as a DNS fallback and written by
    /// [`Client::refresh_hosts_cache`].
    pub fn set_hosts_cache(&mut self, cache: HostsCache) -> &mut Self {
        self.hosts_cache = Some(cache);
        self
    }

    /// Endpoints to use for [`ROOT_CLUSTER`] when DNS cannot resolve it.
    pub fn set_root_hosts(&mut self, hosts: &str) -> &mut Self {
        self.root_hosts = hosts.to_string();
        self
    }

    /// Set the logger that should be used internally in the client.
    ///
    /// By default, all logging is disabled.
    pub fn set_logger(&mut self, logger: Logger) -> &mut Self {
        self.options.logger = logger;
        self
    }

    /// Builds a client whose sessions are opened through `connector`.
    pub fn build(&self, connector: Arc<dyn Connector>) -> Client {
        let logger = self.options.logger.new(o!());
        let resolver = match self.resolver {
            Some(ref resolver) => resolver.clone(),
            None => {
                let mut resolver = AddressResolver::new()
                    .with_logger(logger.clone())
                    .with_static_hosts(ROOT_CLUSTER, &self.root_hosts);
                if let Some(ref cache) = self.hosts_cache {
                    let source = RootHosts {
                        options: SessionOptions {
                            timeout: self.options.timeout,
                            logger: logger.clone(),
                            ..SessionOptions::default()
                        },
                        connector: connector.clone(),
                        resolver: Arc::new(resolver.clone()),
                    };
                    resolver = resolver
                        .with_hosts_cache(cache.clone())
                        .with_hosts_source(Arc::new(source), HOSTS_CACHE_REFRESH);
                }
                Arc::new(resolver)
            }
        };
        Client {
            options: self.options.clone(),
            cluster_domain: self.cluster_domain.clone(),
            proxy_domain: self.proxy_domain.clone(),
            proxy_host: self.proxy_host.clone(),
            connector,
            resolver,
            hosts_cache: self.hosts_cache.clone(),
            credential: Mutex::new(self.options.credential.clone()),
            sessions: Mutex::new(HashMap::new()),
            logger,
        }
    }
}

/// Reads [`HOSTS_NODE`] through a short-lived session on [`ROOT_CLUSTER`].
struct RootHosts {
    options: SessionOptions,
    connector: Arc<dyn Connector>,
    resolver: Arc<dyn Resolve>,
}

#[async_trait]
impl HostsSource for RootHosts {
    async fn fetch(&self) -> Result<String, Error> {
        let session = Session::new(
            ROOT_CLUSTER,
            self.options.clone(),
            self.connector.clone(),
            self.resolver.clone(),
        );
        let contents = read_hosts_node(&session).await;
        session.close().await;
        contents
    }
}

async fn read_hosts_node(session: &Arc<Session>) -> Result<String, Error> {
    session.connect().await?;
    let node = session.open(HOSTS_NODE).await?;
    Ok(String::from_utf8(node.get_content().await?)?)
}

/// Opens nodes on any cluster, one shared session per cluster.
pub struct Client {
    options: SessionOptions,
    cluster_domain: String,
    proxy_domain: String,
    proxy_host: Option<String>,
    connector: Arc<dyn Connector>,
    resolver: Arc<dyn Resolve>,
    hosts_cache: Option<HostsCache>,
    credential: Mutex<String>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    logger: Logger,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Client")
            .field("options", &self.options)
            .field("cluster_domain", &self.cluster_domain)
            .field("proxy_domain", &self.proxy_domain)
            .field("proxy_host", &self.proxy_host)
            .finish()
    }
}

/// What a `/zk/...` path refers to.
#[derive(Debug, PartialEq, Eq)]
enum Target {
    Cluster(String),
    Mock(Option<ZkError>),
}

impl Client {
    /// A [`ClientBuilder`] with the default options.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    fn target(&self, path: &str) -> ZkResult<Target> {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        let name = match (segments.next(), segments.next()) {
            (Some(_), Some(name)) => name,
            _ => return Err(ZkError::InvalidPath),
        };

        if name.starts_with(MOCK_CLUSTER) {
            let error = segments
                .next()
                .filter(|s| s.starts_with("ZK_"))
                .and_then(|s| s.parse().ok());
            return Ok(Target::Mock(error));
        }

        if !self.options.read_only {
            return Ok(Target::Cluster(format!("{}{}", name, self.cluster_domain)));
        }
        if let Some(ref host) = self.proxy_host {
            return Ok(Target::Cluster(host.clone()));
        }
        let mut chars = name.char_indices().skip(1);
        match chars.next() {
            Some((i, c)) => Ok(Target::Cluster(format!(
                "{}{}",
                &name[..i + c.len_utf8()],
                self.proxy_domain
            ))),
            None => Err(ZkError::InvalidPath),
        }
    }

    /// The connected session for `cluster`, creating it if needed. Sessions that fail to connect
    /// are not kept.
    async fn session(&self, cluster: &str) -> ZkResult<Arc<Session>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(cluster) {
            let session = session.clone();
            session.connect().await?;
            return Ok(session);
        }

        let mut options = self.options.clone();
        options.credential = self.credential.lock().await.clone();
        let session = Session::new(
            cluster,
            options,
            self.connector.clone(),
            self.resolver.clone(),
        );
        if let Err(e) = session.connect().await {
            warn!(self.logger, "failed to connect: {}", e; "cluster" => cluster);
            return Err(e);
        }
        info!(self.logger, "opened session"; "cluster" => cluster);
        sessions.insert(cluster.to_string(), session.clone());
        Ok(session)
    }

    /// A handle on the node at `/zk/<cluster>/...`, connecting to the cluster if needed. The
    /// node need not exist.
    pub async fn open(&self, path: &str) -> ZkResult<Node> {
        validate_path(path, false)?;
        match self.target(path)? {
            Target::Mock(error) => {
                debug!(self.logger, "opening mock node"; "path" => path);
                Ok(Node::mock(path, error))
            }
            Target::Cluster(cluster) => self.session(&cluster).await?.open(path).await,
        }
    }

    /// Creates the node at `path`, or opens it if it already exists. The parent must exist;
    /// use [`Node::recursive_create`] to build missing ancestors.
    pub async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> ZkResult<Node> {
        if self.options.read_only {
            return Err(ZkError::ReadOnly);
        }
        let mut node = self.open(path).await?;
        match node.create(data, mode).await {
            Ok(()) => Ok(node),
            Err(ZkError::NodeExists) => {
                debug!(self.logger, "node exists, opening it"; "path" => path);
                Ok(node)
            }
            Err(e) => Err(e),
        }
    }

    /// Opens a node given as `host:port,host:port/path`, connecting straight to those endpoints.
    pub async fn open_with_full_path(&self, full_path: &str) -> ZkResult<Node> {
        let (hosts, path) = match full_path.find('/') {
            Some(0) | None => return Err(ZkError::InvalidPath),
            Some(i) => full_path.split_at(i),
        };
        validate_path(path, false)?;
        self.session(hosts).await?.open(path).await
    }

    /// Closes every session. Pending watches fire with [`ZkEvent::SessionClosed`] and blocked
    /// locks return `Closing`. The client can be used again afterwards.
    pub async fn close(&self) {
        let sessions: Vec<_> = self.sessions.lock().await.drain().collect();
        for (cluster, session) in sessions {
            debug!(self.logger, "closing"; "cluster" => &cluster);
            session.close().await;
        }
    }

    /// Authenticates every open session as `credential`, and every session opened later.
    ///
    /// All sessions are updated; the first failure is returned.
    pub async fn change_identity(&self, credential: &str) -> ZkResult<()> {
        *self.credential.lock().await = credential.to_string();
        let sessions: Vec<_> = self.sessions.lock().await.values().cloned().collect();
        let mut result = Ok(());
        for session in sessions {
            if let Err(e) = session.change_identity(credential).await {
                warn!(self.logger, "failed to change identity: {}", e; "cluster" => session.name());
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Rewrites the hosts cache from [`HOSTS_NODE`] on [`ROOT_CLUSTER`] unless it is fresher
    /// than [`HOSTS_CACHE_REFRESH`].
    pub async fn refresh_hosts_cache(&self) -> Result<(), Error> {
        let cache = self
            .hosts_cache
            .as_ref()
            .ok_or_else(|| format_err!("no hosts cache configured"))?;
        if !cache.is_stale(HOSTS_CACHE_REFRESH).await {
            return Ok(());
        }

        let contents = read_hosts_node(&self.session(ROOT_CLUSTER).await?).await?;
        cache.store(&contents).await?;
        info!(self.logger, "refreshed hosts cache"; "path" => %cache.path().display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StaticResolver;
    use crate::session::SessionStatus;
    use crate::transport::memory::{MemoryEnsemble, Op};
    use crate::KeeperState;

    fn resolver() -> Arc<dyn Resolve> {
        Arc::new(
            StaticResolver::new()
                .with("clusterA.zk.oa.com:2181", "10.0.0.1:2181")
                .with("cl.proxy.zk.oa.com:2181", "10.0.0.2:2181")
                .with(ROOT_CLUSTER, "10.0.0.3:2181"),
        )
    }

    fn client(ensemble: &MemoryEnsemble, configure: impl FnOnce(&mut ClientBuilder)) -> Client {
        let mut builder = Client::builder();
        builder.set_resolver(resolver());
        configure(&mut builder);
        builder.build(Arc::new(ensemble.clone()))
    }

    #[test]
    fn cluster_from_path() {
        let ensemble = MemoryEnsemble::new();
        let c = client(&ensemble, |_| {});
        assert_eq!(
            c.target("/zk/clusterA/x/y"),
            Ok(Target::Cluster("clusterA.zk.oa.com:2181".to_string()))
        );
        assert_eq!(c.target("/zk"), Err(ZkError::InvalidPath));
        assert_eq!(c.target("/zk/mock/a"), Ok(Target::Mock(None)));
        assert_eq!(
            c.target("/zk/mockery/ZK_NONODE"),
            Ok(Target::Mock(Some(ZkError::NoNode)))
        );
        assert_eq!(c.target("/zk/mock/ZK_BOGUS"), Ok(Target::Mock(None)));

        let ro = client(&ensemble, |b| {
            b.set_read_only(true);
        });
        assert_eq!(
            ro.target("/zk/clusterA/x"),
            Ok(Target::Cluster("cl.proxy.zk.oa.com:2181".to_string()))
        );
        assert_eq!(ro.target("/zk/c/x"), Err(ZkError::InvalidPath));

        let pinned = client(&ensemble, |b| {
            b.set_read_only(true).set_proxy_host("proxy:2181");
        });
        assert_eq!(
            pinned.target("/zk/c/x"),
            Ok(Target::Cluster("proxy:2181".to_string()))
        );
    }

    #[tokio::test]
    async fn sessions_are_shared_per_cluster() {
        let ensemble = MemoryEnsemble::new();
        let c = client(&ensemble, |_| {});
        let a = c.open("/zk/clusterA/a").await.unwrap();
        let b = c.open("/zk/clusterA/b").await.unwrap();
        assert!(Arc::ptr_eq(a.session().unwrap(), b.session().unwrap()));
        assert_eq!(ensemble.connects(), 1);
        assert_eq!(a.exists().await, Err(ZkError::NoNode));
    }

    #[tokio::test]
    async fn failed_connects_are_not_cached() {
        let ensemble = MemoryEnsemble::new();
        let c = client(&ensemble, |b| {
            b.set_timeout(Duration::from_millis(50));
        });
        ensemble.set_reachable(false);
        assert_eq!(
            c.open("/zk/clusterA/a").await.unwrap_err(),
            ZkError::OperationTimeout
        );
        assert!(c.sessions.lock().await.is_empty());

        ensemble.set_reachable(true);
        let node = c.open("/zk/clusterA/a").await.unwrap();
        assert_eq!(
            node.session().unwrap().status().await,
            SessionStatus::Connected
        );
    }

    #[tokio::test]
    async fn create_or_open() {
        let ensemble = MemoryEnsemble::new();
        let c = client(&ensemble, |_| {});
        assert_eq!(
            c.create("/zk/clusterA/svc/leader", b"v1", CreateMode::Persistent)
                .await
                .unwrap_err(),
            ZkError::NoNode
        );
        assert!(!ensemble.contains("/zk/clusterA/svc"));

        let mut svc = c.open("/zk/clusterA/svc").await.unwrap();
        svc.recursive_create(b"", CreateMode::Persistent)
            .await
            .unwrap();
        let first = c
            .create("/zk/clusterA/svc/leader", b"v1", CreateMode::Persistent)
            .await
            .unwrap();
        let second = c
            .create("/zk/clusterA/svc/leader", b"v2", CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(first.path(), second.path());
        assert_eq!(second.get_content().await, Ok(b"v1".to_vec()));
        assert_eq!(ensemble.data("/zk/clusterA/svc"), Some(Vec::new()));
    }

    #[tokio::test]
    async fn read_only_clients_use_the_proxy() {
        let ensemble = MemoryEnsemble::new();
        let c = client(&ensemble, |b| {
            b.set_read_only(true);
        });
        assert_eq!(
            c.create("/zk/clusterA/x", b"", CreateMode::Persistent)
                .await
                .unwrap_err(),
            ZkError::ReadOnly
        );
        let node = c.open("/zk/clusterA/x").await.unwrap();
        assert_eq!(node.session().unwrap().name(), "cl.proxy.zk.oa.com:2181");
        assert_eq!(node.exists().await, Err(ZkError::NoNode));
        assert_eq!(node.set_content(b"x", -1).await, Err(ZkError::ReadOnly));
        assert_eq!(ensemble.calls(Op::SetData), 0);
    }

    #[tokio::test]
    async fn full_paths_name_their_endpoints() {
        let ensemble = MemoryEnsemble::new();
        let c = client(&ensemble, |_| {});
        let node = c
            .open_with_full_path("10.0.0.7:2181,10.0.0.8:2181/zk/anything/x")
            .await
            .unwrap();
        assert_eq!(node.path(), "/zk/anything/x");
        assert_eq!(
            node.session().unwrap().name(),
            "10.0.0.7:2181,10.0.0.8:2181"
        );
        assert_eq!(
            c.open_with_full_path("/zk/anything/x").await.unwrap_err(),
            ZkError::InvalidPath
        );
        assert_eq!(
            c.open_with_full_path("10.0.0.7:2181").await.unwrap_err(),
            ZkError::InvalidPath
        );
    }

    #[tokio::test]
    async fn identity_applies_to_open_and_future_sessions() {
        let ensemble = MemoryEnsemble::new();
        let c = client(&ensemble, |_| {});
        let a = c.open("/zk/clusterA/a").await.unwrap();
        c.change_identity("alice:secret").await.unwrap();
        let b = c.open_with_full_path("10.9.9.9:2181/x").await.unwrap();

        for node in [a, b].iter() {
            let id = node.session().unwrap().id().await;
            let id = i64::from_str_radix(id.trim_start_matches("0x"), 16).unwrap();
            assert!(ensemble
                .auth_of(id)
                .contains(&("digest".to_string(), b"alice:secret".to_vec())));
        }
        assert_eq!(c.change_identity("nocolon").await, Err(ZkError::AuthFailed));
    }

    #[tokio::test]
    async fn close_then_reopen() {
        let ensemble = MemoryEnsemble::new();
        let c = client(&ensemble, |_| {});
        let node = c.open("/zk/clusterA/a").await.unwrap();
        c.close().await;
        assert_eq!(node.exists().await, Err(ZkError::InvalidState));
        assert_eq!(ensemble.session_ids().len(), 0);

        c.open("/zk/clusterA/a").await.unwrap();
        assert_eq!(ensemble.connects(), 2);
    }

    #[tokio::test]
    async fn refresh_hosts_cache_from_the_root_cluster() {
        let ensemble = MemoryEnsemble::new();
        let dir = tempfile::tempdir().unwrap();
        let cache = HostsCache::new(dir.path().join("zk_hosts"));
        let c = client(&ensemble, |b| {
            b.set_hosts_cache(cache.clone());
        });

        assert!(c.refresh_hosts_cache().await.is_err());
        let mut hosts = c.open(HOSTS_NODE).await.unwrap();
        hosts
            .recursive_create(
                b"clusterB.zk.oa.com:2181=10.2.0.1:2181",
                CreateMode::Persistent,
            )
            .await
            .unwrap();

        c.refresh_hosts_cache().await.unwrap();
        assert_eq!(
            cache.lookup("clusterB.zk.oa.com").await.unwrap(),
            Some(vec!["10.2.0.1:2181".to_string()])
        );
        // fresh caches are left alone
        ensemble.remove(HOSTS_NODE);
        c.refresh_hosts_cache().await.unwrap();

        let unconfigured = client(&ensemble, |_| {});
        assert!(unconfigured.refresh_hosts_cache().await.is_err());
    }

    #[tokio::test]
    async fn unresolvable_clusters_refresh_a_stale_hosts_cache() {
        let ensemble = MemoryEnsemble::new();
        let seed = client(&ensemble, |_| {});
        let mut hosts = seed.open(HOSTS_NODE).await.unwrap();
        hosts
            .recursive_create(b"clusterB.zk.invalid:2181=10.2.0.1:2181", CreateMode::Persistent)
            .await
            .unwrap();
        seed.close().await;
        let connects = ensemble.connects();

        let dir = tempfile::tempdir().unwrap();
        let cache = HostsCache::new(dir.path().join("zk_hosts"));
        let mut builder = Client::builder();
        builder
            .set_cluster_domain(".zk.invalid:2181")
            .set_hosts_cache(cache.clone())
            .set_timeout(Duration::from_millis(500));
        let c = builder.build(Arc::new(ensemble.clone()));

        let node = c.open("/zk/clusterB/x").await.unwrap();
        assert_eq!(node.session().unwrap().name(), "clusterB.zk.invalid:2181");
        assert_eq!(node.exists().await, Err(ZkError::NoNode));
        assert_eq!(
            cache.lookup("clusterB.zk.invalid").await.unwrap(),
            Some(vec!["10.2.0.1:2181".to_string()])
        );
        // the root session used for the refresh, then the cluster's own
        assert_eq!(ensemble.connects(), connects + 2);
    }

    #[tokio::test]
    async fn session_events_reach_the_handler() {
        let ensemble = MemoryEnsemble::new();
        let (tx, mut rx) = futures::channel::mpsc::unbounded();
        let c = client(&ensemble, move |b| {
            b.set_session_event_handler(move |cluster: String, event: ZkEvent| {
                let _ = tx.unbounded_send((cluster, event));
            });
        });
        let node = c.open("/zk/clusterA/a").await.unwrap();
        let id = node.session().unwrap().id().await;
        let id = i64::from_str_radix(id.trim_start_matches("0x"), 16).unwrap();
        ensemble.notify_session(id, KeeperState::Disconnected);

        use futures::StreamExt;
        assert_eq!(
            rx.next().await,
            Some(("clusterA.zk.oa.com:2181".to_string(), ZkEvent::SessionConnected))
        );
        assert_eq!(
            rx.next().await,
            Some(("clusterA.zk.oa.com:2181".to_string(), ZkEvent::SessionConnecting))
        );
    }
}
