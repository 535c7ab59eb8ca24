//! This crate provides a session, watch and lock layer for clients of [Apache
//! ZooKeeper](https://zookeeper.apache.org/).
//!
//! Nodes are addressed as `/zk/<cluster>/...`: the second path segment names the cluster, and a
//! [`Client`] keeps one [`Session`] per cluster. Sessions retry transient failures, survive
//! expiry by reconnecting, and multiplex any number of one-shot watches onto the server's own.
//! On top of that, [`Node::lock`] and friends implement the usual sequential-ephemeral-node
//! lock recipe.
//!
//! The crate does not speak the wire protocol itself. It drives a [`transport::Connector`],
//! and ships [`transport::memory::MemoryEnsemble`], an in-process ensemble useful for tests.
//!
//! # Interacting with the cluster
//!
//! ```
//! use std::sync::Arc;
//! use zk_session::resolver::StaticResolver;
//! use zk_session::transport::memory::MemoryEnsemble;
//! use zk_session::{Client, CreateMode, ZkEvent};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), zk_session::ZkError> {
//! let mut builder = Client::builder();
//! builder.set_resolver(Arc::new(
//!     StaticResolver::new().with("example.zk.oa.com:2181", "127.0.0.1:2181"),
//! ));
//! let client = builder.build(Arc::new(MemoryEnsemble::new()));
//!
//! // creates /zk and /zk/example too
//! let mut node = client.open("/zk/example/config").await?;
//! node.recursive_create(b"v1", CreateMode::Persistent).await?;
//! assert_eq!(node.get_content().await?, b"v1".to_vec());
//!
//! let (tx, rx) = futures::channel::oneshot::channel();
//! node.watch_content(move |path, event| {
//!     let _ = tx.send((path, event));
//! })
//! .await?;
//! node.set_content(b"v2", -1).await?;
//! assert_eq!(
//!     rx.await.unwrap(),
//!     ("/zk/example/config".to_string(), ZkEvent::NodeChanged)
//! );
//!
//! node.lock().await?;
//! // ...
//! node.unlock().await?;
//!
//! node.recursive_delete().await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Thread safety
//!
//! Everything here is `Send + Sync`. A [`Node`] is just a path plus a handle on its session, and
//! can be cloned and moved between tasks freely.

mod client;
mod error;
mod lock;
mod node;
pub mod resolver;
mod session;
pub mod transport;
mod types;
mod watcher;

pub use crate::client::{
    Client, ClientBuilder, DEFAULT_CLUSTER_DOMAIN, DEFAULT_PROXY_DOMAIN, DEFAULT_ROOT_HOSTS,
    HOSTS_CACHE_REFRESH, HOSTS_NODE, ROOT_CLUSTER,
};
pub use crate::error::{ErrorCategory, UnknownErrorName, ZkError, ZkEvent, ZkResult};
pub use crate::lock::{sorted_lock_nodes, AsyncLockWaiter, LockCallback, LOCK_NODE_PREFIX};
pub use crate::node::{validate_path, Node, MAX_BUFFER_LEN, MOCK_CONTENT};
pub use crate::session::{Session, SessionEventHandler, SessionOptions, SessionStatus};
pub use crate::types::*;
pub use crate::watcher::{ChildrenCallback, NodeCallback, WatchCallback, WatchKind, WatcherRegistry};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StaticResolver;
    use crate::transport::memory::{Fault, MemoryEnsemble, Op};
    use futures::channel::oneshot;
    use slog::{o, Drain};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn test_logger() -> slog::Logger {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, o!())
    }

    fn client(ensemble: &MemoryEnsemble) -> Client {
        let mut builder = Client::builder();
        builder
            .set_resolver(Arc::new(
                StaticResolver::new().with("clusterA.zk.oa.com:2181", "10.0.0.1:2181"),
            ))
            .set_logger(test_logger());
        builder.build(Arc::new(ensemble.clone()))
    }

    async fn create_all(client: &Client, path: &str, data: &[u8]) -> Node {
        let mut node = client.open(path).await.unwrap();
        node.recursive_create(data, CreateMode::Persistent)
            .await
            .unwrap();
        node
    }

    #[tokio::test]
    async fn it_works() {
        let ensemble = MemoryEnsemble::new();
        let client = client(&ensemble);

        let mut node = client.open("/zk/clusterA/test").await.unwrap();
        node.recursive_create(b"hello", CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(node.get_content().await.unwrap(), b"hello".to_vec());
        let stat = node.exists().await.unwrap();
        assert_eq!(stat.data_length, 5);

        // watch, then change
        let (tx, rx) = oneshot::channel();
        let seen = node
            .watch_content(move |path, event| {
                let _ = tx.send((path, event));
            })
            .await
            .unwrap();
        assert_eq!(seen, b"hello".to_vec());
        node.set_content(b"world", stat.version).await.unwrap();
        assert_eq!(
            rx.await.unwrap(),
            ("/zk/clusterA/test".to_string(), ZkEvent::NodeChanged)
        );
        assert_eq!(node.get_content().await.unwrap(), b"world".to_vec());
        assert_eq!(
            node.set_content(b"stale", stat.version).await,
            Err(ZkError::BadVersion)
        );

        // children
        let mut child = client
            .open("/zk/clusterA/test/child-")
            .await
            .unwrap();
        child
            .create(b"c", CreateMode::PersistentSequential)
            .await
            .unwrap();
        assert_eq!(child.path(), "/zk/clusterA/test/child-0000000000");
        assert_eq!(node.children().await.unwrap(), vec![child.path().to_string()]);
        assert_eq!(
            node.get_child_content("child-0000000000").await.unwrap(),
            b"c".to_vec()
        );

        // lock
        node.lock().await.unwrap();
        assert!(node.is_locked().await.unwrap());
        node.unlock().await.unwrap();
        assert!(!node.is_locked().await.unwrap());

        // acl
        let (acl, _) = node.get_acl().await.unwrap();
        assert_eq!(acl.permission("world", "anyone"), Some(Permission::ALL));

        node.recursive_delete().await.unwrap();
        assert_eq!(node.exists().await, Err(ZkError::NoNode));
        assert!(ensemble.contains("/zk/clusterA"));

        client.close().await;
    }

    #[tokio::test]
    async fn oversized_content_never_reaches_the_server() {
        let ensemble = MemoryEnsemble::new();
        let client = client(&ensemble);
        let node = create_all(&client, "/zk/clusterA/big", b"").await;

        let big = vec![0u8; MAX_BUFFER_LEN];
        assert_eq!(node.set_content(&big, -1).await, Err(ZkError::InvalidData));
        assert_eq!(ensemble.calls(Op::SetData), 0);
        node.set_content(&big[1..], -1).await.unwrap();
        assert_eq!(node.get_content().await.unwrap().len(), MAX_BUFFER_LEN - 1);
    }

    #[tokio::test]
    async fn recursive_delete_tolerates_concurrent_deletes() {
        let ensemble = MemoryEnsemble::new();
        let client = client(&ensemble);
        for leaf in ["a/x", "a/y", "b"].iter() {
            create_all(&client, &format!("/zk/clusterA/tree/{}", leaf), b"").await;
        }
        ensemble.inject(Fault::vanish(Op::Delete, "/zk/clusterA/tree/a/x"));
        ensemble.inject(Fault::vanish(Op::GetChildren, "/zk/clusterA/tree/b"));

        let tree = client.open("/zk/clusterA/tree").await.unwrap();
        tree.recursive_delete().await.unwrap();
        assert!(!ensemble.contains("/zk/clusterA/tree"));
    }

    #[tokio::test]
    async fn watches_fire_exactly_once_when_racing_close() {
        let ensemble = MemoryEnsemble::new();
        let client = client(&ensemble);
        let writer = create_all(&client, "/zk/clusterA/race", b"").await;

        let other = {
            let mut builder = Client::builder();
            builder.set_resolver(Arc::new(
                StaticResolver::new().with("clusterA.zk.oa.com:2181", "10.0.0.1:2181"),
            ));
            builder.build(Arc::new(ensemble.clone()))
        };
        let watched = other.open("/zk/clusterA/race").await.unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let fired = fired.clone();
            watched
                .watch_content(move |_, _| {
                    fired.fetch_add(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
        }

        let (set, _) = futures::join!(writer.set_content(b"x", -1), other.close());
        set.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn mock_paths_never_connect() {
        let ensemble = MemoryEnsemble::new();
        let client = client(&ensemble);

        let ok = client.open("/zk/mock/anything").await.unwrap();
        assert!(ok.is_mock());
        assert_eq!(ok.get_content().await, Ok(MOCK_CONTENT.to_vec()));
        ok.set_content(b"x", -1).await.unwrap();

        let failing = client.open("/zk/mock/ZK_NONODE/x").await.unwrap();
        assert_eq!(failing.get_content().await, Err(ZkError::NoNode));
        assert_eq!(failing.lock().await, Err(ZkError::NoNode));

        assert_eq!(ensemble.connects(), 0);
    }

    #[tokio::test]
    async fn read_only_client_reads_through_the_proxy() {
        let ensemble = MemoryEnsemble::new();
        let writer = client(&ensemble);
        create_all(&writer, "/zk/clusterA/shared", b"v").await;

        let mut builder = Client::builder();
        builder
            .set_read_only(true)
            .set_proxy_host("10.0.0.9:2181")
            .set_timeout(Duration::from_millis(500));
        let reader = builder.build(Arc::new(ensemble.clone()));
        let node = reader.open("/zk/clusterA/shared").await.unwrap();
        assert_eq!(node.get_content().await, Ok(b"v".to_vec()));
        assert_eq!(node.delete(-1).await, Err(ZkError::ReadOnly));
        assert_eq!(node.lock().await, Err(ZkError::ReadOnly));
        assert_eq!(
            node.watch_content(|_, _| {}).await,
            Err(ZkError::ReadOnly)
        );
    }
}
