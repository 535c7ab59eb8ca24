//! The seam between the session layer and whatever actually talks to the ensemble.
//!
//! A [`Connector`] opens server sessions; the [`Transport`] it hands back issues individual
//! requests on one of them. Every event the server pushes for that session (state transitions
//! as well as triggered watches) is sent to the [`EventSender`] given to
//! [`Connector::connect`]. Dropping the last reference to a transport closes its server session.

use crate::{Acl, CreateMode, KeeperState, Stat, WatchedEvent, ZkResult};
use async_trait::async_trait;
use futures::channel::mpsc;
use std::sync::Arc;
use std::time::Duration;

pub mod memory;

/// Where a transport delivers the events of its session.
pub type EventSender = mpsc::UnboundedSender<WatchedEvent>;

/// Receiving end of an [`EventSender`].
pub type EventReceiver = mpsc::UnboundedReceiver<WatchedEvent>;

/// A live connection to one server session.
///
/// Requests that take a `watch` flag leave a one-shot watch on the server when they succeed; an
/// `exists` call also leaves one when the node does not exist. Triggered watches arrive as
/// [`WatchedEvent`]s on the session's event channel.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The client id the server assigned to this session. Zero until the handshake completes.
    fn session_id(&self) -> i64;

    /// The current state of the connection.
    fn state(&self) -> KeeperState;

    /// Adds authentication information to the session.
    async fn add_auth(&self, scheme: &str, auth: &[u8]) -> ZkResult<()>;

    /// Creates a node and returns its actual path (which differs for sequential nodes).
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        acl: &[Acl],
        mode: CreateMode,
    ) -> ZkResult<String>;

    /// Deletes a node; `version` -1 matches any version.
    async fn delete(&self, path: &str, version: i32) -> ZkResult<()>;

    /// Returns the node's stat, or `NoNode`.
    async fn exists(&self, path: &str, watch: bool) -> ZkResult<Stat>;

    /// Returns the node's data and stat.
    async fn get_data(&self, path: &str, watch: bool) -> ZkResult<(Vec<u8>, Stat)>;

    /// Replaces the node's data; `version` -1 matches any version.
    async fn set_data(&self, path: &str, data: &[u8], version: i32) -> ZkResult<Stat>;

    /// Returns the names (not paths) of the node's children.
    async fn get_children(&self, path: &str, watch: bool) -> ZkResult<Vec<String>>;

    /// Returns the node's ACL and stat.
    async fn get_acl(&self, path: &str) -> ZkResult<(Vec<Acl>, Stat)>;

    /// Replaces the node's ACL; `version` -1 matches any ACL version.
    async fn set_acl(&self, path: &str, acl: &[Acl], version: i32) -> ZkResult<Stat>;
}

/// Opens server sessions.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Starts a new session against any of `hosts`.
    ///
    /// This only initiates the handshake: the session is usable once a connected state event
    /// has been sent to `events`.
    async fn connect(
        &self,
        hosts: &[String],
        session_timeout: Duration,
        events: EventSender,
    ) -> ZkResult<Arc<dyn Transport>>;
}
