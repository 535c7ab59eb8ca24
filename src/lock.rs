//! Distributed mutual exclusion on top of a [`Node`].
//!
//! A session that wants the lock on some node creates an ephemeral, sequential child named
//! `zoo_attr_lock_<session id>-<sequence>` under it. The child with the smallest sequence holds
//! the lock; every other contender watches the child just before its own and looks again once
//! that one changes. Since the children are ephemeral, a crashed holder releases the lock when
//! its session ends.

use crate::node::Node;
use crate::session::Session;
use crate::watcher::{child_path, WatchCallback};
use crate::{Acl, CreateMode, ZkError, ZkEvent, ZkResult};
use futures::channel::oneshot;
use futures::future::BoxFuture;
use slog::{debug, error, trace};
use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, Weak};

/// The name prefix shared by all lock children.
pub const LOCK_NODE_PREFIX: &str = "zoo_attr_lock_";

/// Told the outcome of [`Node::async_lock`]: the locked path and the result.
pub type LockCallback = Box<dyn FnOnce(String, ZkResult<()>) + Send + 'static>;

fn sequence_of(name: &str) -> &str {
    match name.rfind('-') {
        Some(i) => &name[i + 1..],
        None => name,
    }
}

fn compare_lock_nodes(a: &str, b: &str) -> Ordering {
    let (x, y) = (sequence_of(a), sequence_of(b));
    match (x.parse::<u64>(), y.parse::<u64>()) {
        (Ok(m), Ok(n)) => m.cmp(&n).then_with(|| x.cmp(y)),
        _ => x.cmp(y),
    }
}

/// Keeps the lock children among `names`, in lock order.
pub fn sorted_lock_nodes<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut locks: Vec<String> = names
        .into_iter()
        .map(Into::into)
        .filter(|n| n.starts_with(LOCK_NODE_PREFIX))
        .collect();
    locks.sort_by(|a, b| compare_lock_nodes(a, b));
    locks
}

/// The name prefix of the lock children `session` owns. The trailing `-` keeps id `0x1` from
/// claiming the children of `0x10`.
async fn own_prefix(session: &Session) -> ZkResult<String> {
    let id = session.id().await;
    if id.is_empty() {
        return Err(ZkError::Disconnected);
    }
    Ok(format!("{}{}-", LOCK_NODE_PREFIX, id))
}

impl Node {
    /// Returns the name of this session's lock child, creating it if there is none yet.
    pub async fn find_or_create_lock_node(&self) -> ZkResult<String> {
        let session = match self.backend() {
            Ok(s) => s,
            Err(r) => return r.map(|_| String::new()),
        };
        let prefix = own_prefix(session).await?;
        let children = session.get_children(self.path()).await?;
        if let Some(mine) = children.into_iter().find(|c| c.starts_with(&prefix)) {
            trace!(session.logger(), "reusing lock node"; "node" => &mine);
            return Ok(mine);
        }

        let created = session
            .create(
                &child_path(self.path(), &prefix),
                b"",
                Acl::open_unsafe(),
                CreateMode::EphemeralSequential,
            )
            .await?;
        let name = match created.rfind('/') {
            Some(i) => created[i + 1..].to_string(),
            None => created,
        };
        debug!(session.logger(), "created lock node"; "path" => self.path(), "node" => &name);
        Ok(name)
    }

    /// The lock child queued right before this session's, or `None` if this session holds the
    /// lock. `NoNode` if this session has no lock child.
    pub async fn find_precursor(&self) -> ZkResult<Option<String>> {
        let session = match self.backend() {
            Ok(s) => s,
            Err(r) => return r.map(|_| None),
        };
        let prefix = own_prefix(session).await?;
        let locks = sorted_lock_nodes(session.get_children(self.path()).await?);
        match locks.iter().position(|n| n.starts_with(&prefix)) {
            None => Err(ZkError::NoNode),
            Some(0) => Ok(None),
            Some(i) => Ok(Some(locks[i - 1].clone())),
        }
    }

    /// Takes the lock, waiting for as long as other sessions hold it.
    ///
    /// Calling this again while holding the lock returns at once. Fails with `Closing` if the
    /// session is closed while waiting.
    pub async fn lock(&self) -> ZkResult<()> {
        let session = match self.backend() {
            Ok(s) => s,
            Err(r) => return r,
        };
        self.find_or_create_lock_node().await?;
        // a watch that has not fired yet stays armed across poll timeouts
        let mut armed: Option<(String, oneshot::Receiver<ZkEvent>)> = None;
        loop {
            let precursor = match self.find_precursor().await? {
                None => return Ok(()),
                Some(name) => child_path(self.path(), &name),
            };

            let mut rx = match armed.take() {
                Some((watched, rx)) if watched == precursor => rx,
                _ => {
                    let (tx, rx) = oneshot::channel();
                    match session
                        .watcher_registry()
                        .register_data_watch(session, &precursor, WatchCallback::Signal(tx))
                        .await
                    {
                        Ok(_) => {}
                        // gone already: look again
                        Err((ZkError::NoNode, _)) => continue,
                        Err((e, _)) => return Err(e),
                    }
                    debug!(session.logger(), "waiting for lock"; "precursor" => &precursor);
                    rx
                }
            };

            match tokio::time::timeout(session.options().lock_poll_interval, &mut rx).await {
                Ok(Ok(ZkEvent::SessionClosed)) | Ok(Err(oneshot::Canceled)) => {
                    return Err(ZkError::Closing)
                }
                Ok(Ok(event)) => {
                    trace!(session.logger(), "precursor changed"; "event" => %event);
                }
                Err(_) => {
                    trace!(session.logger(), "still waiting for lock"; "precursor" => &precursor);
                    armed = Some((precursor, rx));
                }
            }
        }
    }

    /// Takes the lock if nobody else holds it, failing with `AlreadyLocked` otherwise. Never
    /// waits and never leaves a watch behind. The lock child stays queued either way.
    pub async fn try_lock(&self) -> ZkResult<()> {
        if let Err(r) = self.backend() {
            return r;
        }
        self.find_or_create_lock_node().await?;
        match self.find_precursor().await? {
            None => Ok(()),
            Some(_) => Err(ZkError::AlreadyLocked),
        }
    }

    /// Takes the lock in the background and calls `callback` exactly once with the outcome.
    ///
    /// Must be called from within a tokio runtime. If the session is closed while the lock is
    /// held by someone else, `callback` gets `Closing`.
    pub fn async_lock<F>(&self, callback: F)
    where
        F: FnOnce(String, ZkResult<()>) + Send + 'static,
    {
        match self.backend() {
            Ok(session) => {
                tokio::spawn(resolve(
                    session.clone(),
                    self.path().to_string(),
                    Box::new(callback),
                ));
            }
            Err(r) => callback(self.path().to_string(), r),
        }
    }

    /// Releases the lock. Fails with `NoAuth` if another session holds it; succeeds if nobody
    /// does.
    pub async fn unlock(&self) -> ZkResult<()> {
        let session = match self.backend() {
            Ok(s) => s,
            Err(r) => return r,
        };
        let locks = sorted_lock_nodes(session.get_children(self.path()).await?);
        let head = match locks.first() {
            Some(head) => head,
            None => return Ok(()),
        };
        if !head.starts_with(&own_prefix(session).await?) {
            return Err(ZkError::NoAuth);
        }
        session.delete(&child_path(self.path(), head), -1).await
    }

    /// Whether any session holds or waits for the lock.
    pub async fn is_locked(&self) -> ZkResult<bool> {
        let session = match self.backend() {
            Ok(s) => s,
            Err(r) => return r.map(|_| false),
        };
        let children = session.get_children(self.path()).await?;
        Ok(children.iter().any(|c| c.starts_with(LOCK_NODE_PREFIX)))
    }
}

/// A pending [`Node::async_lock`], parked on the precursor's data watch.
pub struct AsyncLockWaiter {
    session: Weak<Session>,
    path: String,
    callback: LockCallback,
}

impl fmt::Debug for AsyncLockWaiter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AsyncLockWaiter")
            .field("path", &self.path)
            .finish()
    }
}

impl AsyncLockWaiter {
    /// The path being locked.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn fire(self, event: ZkEvent) {
        if event == ZkEvent::SessionClosed {
            return (self.callback)(self.path, Err(ZkError::Closing));
        }
        match self.session.upgrade() {
            Some(session) => {
                tokio::spawn(resolve(session, self.path, self.callback));
            }
            None => (self.callback)(self.path, Err(ZkError::Closing)),
        }
    }
}

/// Drives one [`Node::async_lock`] until it either holds the lock, fails, or parks itself on a
/// precursor watch.
fn resolve(session: Arc<Session>, path: String, callback: LockCallback) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let node = match session.open(&path).await {
            Ok(node) => node,
            Err(e) => return callback(path, Err(e)),
        };
        if let Err(e) = node.find_or_create_lock_node().await {
            return callback(path, Err(e));
        }

        let mut callback = callback;
        loop {
            let precursor = match node.find_precursor().await {
                Ok(None) => return callback(path, Ok(())),
                Ok(Some(name)) => child_path(&path, &name),
                Err(e) => return callback(path, Err(e)),
            };
            let waiter = WatchCallback::AsyncLock(AsyncLockWaiter {
                session: Arc::downgrade(&session),
                path: path.clone(),
                callback,
            });
            let (e, rejected) = match session
                .watcher_registry()
                .register_data_watch(&session, &precursor, waiter)
                .await
            {
                Ok(_) => {
                    debug!(session.logger(), "waiting for lock"; "precursor" => &precursor);
                    return;
                }
                Err(rejected) => rejected,
            };
            callback = match rejected {
                WatchCallback::AsyncLock(waiter) => waiter.callback,
                other => {
                    error!(session.logger(), "lost lock callback"; "watch" => ?other);
                    return;
                }
            };
            if e != ZkError::NoNode {
                return callback(path, Err(e));
            }
        }
    })
}
