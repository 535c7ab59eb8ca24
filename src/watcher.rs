//! Per-session bookkeeping of the watches callers have armed.
//!
//! The server only tells a session *that* a watch on some path fired. The [`WatcherRegistry`]
//! remembers which callbacks were waiting on that path, and hands each of them exactly one event:
//! either the matching node event, or [`ZkEvent::SessionClosed`] when the session goes away first.

use crate::lock::AsyncLockWaiter;
use crate::node::MAX_BUFFER_LEN;
use crate::session::Session;
use crate::{Stat, ZkError, ZkEvent, ZkResult};
use futures::channel::oneshot;
use std::collections::HashMap;
use std::fmt;
use std::mem;
use tokio::sync::Mutex;

/// Called with the watched path and the event that fired.
pub type NodeCallback = Box<dyn FnOnce(String, ZkEvent) + Send + 'static>;

/// Called with the watched path, the event that fired, and the children (as full paths) the node
/// had when the watch was armed.
pub type ChildrenCallback = Box<dyn FnOnce(String, ZkEvent, Vec<String>) + Send + 'static>;

/// A single pending watch.
pub enum WatchCallback {
    Node(NodeCallback),
    Children {
        previous: Vec<String>,
        callback: ChildrenCallback,
    },
    /// Wakes a task waiting on the other end.
    Signal(oneshot::Sender<ZkEvent>),
    /// Resumes a pending [`Node::async_lock`](crate::Node::async_lock).
    AsyncLock(AsyncLockWaiter),
}

impl WatchCallback {
    pub fn node<F>(f: F) -> Self
    where
        F: FnOnce(String, ZkEvent) + Send + 'static,
    {
        WatchCallback::Node(Box::new(f))
    }

    pub fn children<F>(f: F) -> Self
    where
        F: FnOnce(String, ZkEvent, Vec<String>) + Send + 'static,
    {
        WatchCallback::Children {
            previous: Vec::new(),
            callback: Box::new(f),
        }
    }

    /// Consumes the watch, delivering `event` for `path`.
    pub fn deliver(self, path: String, event: ZkEvent) {
        match self {
            WatchCallback::Node(f) => f(path, event),
            WatchCallback::Children { previous, callback } => callback(path, event, previous),
            WatchCallback::Signal(tx) => {
                // the waiter may have given up already
                let _ = tx.send(event);
            }
            WatchCallback::AsyncLock(waiter) => waiter.fire(event),
        }
    }
}

impl fmt::Debug for WatchCallback {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WatchCallback::Node(_) => write!(f, "WatchCallback::Node"),
            WatchCallback::Children { previous, .. } => {
                write!(f, "WatchCallback::Children({} previous)", previous.len())
            }
            WatchCallback::Signal(_) => write!(f, "WatchCallback::Signal"),
            WatchCallback::AsyncLock(ref w) => write!(f, "WatchCallback::AsyncLock({})", w.path()),
        }
    }
}

/// The kind of watch a callback is registered as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// Armed by a read; fires on change and deletion.
    Data,
    /// Armed by an existence check; fires on creation, change and deletion.
    Exists,
    /// Armed by listing children; fires on membership changes and deletion.
    Children,
}

type WatchMap = HashMap<String, Vec<WatchCallback>>;

#[derive(Default)]
struct Watches {
    data: WatchMap,
    exists: WatchMap,
    children: WatchMap,
}

impl Watches {
    fn map(&mut self, kind: WatchKind) -> &mut WatchMap {
        match kind {
            WatchKind::Data => &mut self.data,
            WatchKind::Exists => &mut self.exists,
            WatchKind::Children => &mut self.children,
        }
    }

    fn insert(&mut self, kind: WatchKind, path: &str, callback: WatchCallback) {
        self.map(kind)
            .entry(path.to_string())
            .or_insert_with(Vec::new)
            .push(callback);
    }

    fn take(&mut self, kind: WatchKind, path: &str, into: &mut Vec<WatchCallback>) {
        if let Some(mut found) = self.map(kind).remove(path) {
            into.append(&mut found);
        }
    }

    fn into_all(self) -> Vec<(String, WatchCallback)> {
        let mut all = Vec::new();
        for map in vec![self.data, self.exists, self.children] {
            for (path, callbacks) in map {
                all.extend(callbacks.into_iter().map(|cb| (path.clone(), cb)));
            }
        }
        all
    }
}

/// A registration that could not be armed. The callback is handed back untouched.
pub type Rejected = (ZkError, WatchCallback);

/// Path-keyed sets of pending watches for one session.
///
/// Registrations hold the registry lock for the whole server round trip, so an event for a
/// watch cannot be collected before the watch is recorded. Callbacks always run with the lock
/// released, so they are free to register new watches.
#[derive(Default)]
pub struct WatcherRegistry {
    inner: Mutex<Watches>,
}

impl fmt::Debug for WatcherRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WatcherRegistry").finish()
    }
}

impl WatcherRegistry {
    pub fn new() -> Self {
        WatcherRegistry::default()
    }

    /// Reads `path` with a watch and, if that succeeds, registers `callback` as a data watch.
    /// Data larger than [`MAX_BUFFER_LEN`] is refused with `InvalidData` and registers nothing.
    pub async fn register_data_watch(
        &self,
        session: &Session,
        path: &str,
        callback: WatchCallback,
    ) -> Result<(Vec<u8>, Stat), Rejected> {
        let mut watches = self.inner.lock().await;
        match session.watcher_get(path).await {
            Ok((data, _)) if data.len() > MAX_BUFFER_LEN => Err((ZkError::InvalidData, callback)),
            Ok(found) => {
                watches.insert(WatchKind::Data, path, callback);
                Ok(found)
            }
            Err(e) => Err((e, callback)),
        }
    }

    /// Checks `path` with a watch and registers `callback` as an exists watch. A missing node
    /// still arms the watch; the result is then `Err(NoNode)` inside the `Ok`.
    pub async fn register_exists_watch(
        &self,
        session: &Session,
        path: &str,
        callback: WatchCallback,
    ) -> Result<ZkResult<Stat>, Rejected> {
        let mut watches = self.inner.lock().await;
        match session.watcher_exists(path).await {
            Ok(stat) => {
                watches.insert(WatchKind::Exists, path, callback);
                Ok(Ok(stat))
            }
            Err(ZkError::NoNode) => {
                watches.insert(WatchKind::Exists, path, callback);
                Ok(Err(ZkError::NoNode))
            }
            Err(e) => Err((e, callback)),
        }
    }

    /// Lists the children of `path` with a watch and registers `callback` as a children watch.
    ///
    /// A [`WatchCallback::Children`] callback is given the listing it was armed with.
    pub async fn register_children_watch(
        &self,
        session: &Session,
        path: &str,
        mut callback: WatchCallback,
    ) -> Result<Vec<String>, Rejected> {
        let mut watches = self.inner.lock().await;
        match session.watcher_get_children(path).await {
            Ok(children) => {
                if let WatchCallback::Children {
                    ref mut previous, ..
                } = callback
                {
                    *previous = children.iter().map(|c| child_path(path, c)).collect();
                }
                watches.insert(WatchKind::Children, path, callback);
                Ok(children)
            }
            Err(e) => Err((e, callback)),
        }
    }

    /// Removes and returns the callbacks that `event` on `path` fires.
    pub async fn collect(&self, path: &str, event: ZkEvent) -> Vec<WatchCallback> {
        let mut fired = Vec::new();
        let mut watches = self.inner.lock().await;
        match event {
            ZkEvent::NodeCreated => watches.take(WatchKind::Exists, path, &mut fired),
            ZkEvent::NodeDeleted | ZkEvent::NodeChanged => {
                watches.take(WatchKind::Data, path, &mut fired);
                watches.take(WatchKind::Exists, path, &mut fired);
                if event == ZkEvent::NodeDeleted {
                    watches.take(WatchKind::Children, path, &mut fired);
                }
            }
            ZkEvent::ChildChanged => watches.take(WatchKind::Children, path, &mut fired),
            _ => {}
        }
        fired
    }

    /// Fires the watches `event` on `path` triggers.
    pub async fn dispatch(&self, path: &str, event: ZkEvent) -> usize {
        let fired = self.collect(path, event).await;
        let n = fired.len();
        for callback in fired {
            callback.deliver(path.to_string(), event);
        }
        n
    }

    /// Empties the registry and delivers `event` to every pending watch.
    pub async fn drain_and_close_all(&self, event: ZkEvent) -> usize {
        let watches = mem::take(&mut *self.inner.lock().await);
        deliver_all(watches, event)
    }

    /// Like [`WatcherRegistry::drain_and_close_all`], for when the registry is exclusively owned.
    pub(crate) fn drain_owned(&mut self, event: ZkEvent) -> usize {
        let watches = mem::take(self.inner.get_mut());
        deliver_all(watches, event)
    }

    /// How many watches of `kind` are pending on `path`.
    pub async fn pending(&self, kind: WatchKind, path: &str) -> usize {
        self.inner
            .lock()
            .await
            .map(kind)
            .get(path)
            .map_or(0, Vec::len)
    }
}

fn deliver_all(watches: Watches, event: ZkEvent) -> usize {
    let all = watches.into_all();
    let n = all.len();
    for (path, callback) in all {
        callback.deliver(path, event);
    }
    n
}

/// Joins a parent path and a child name.
pub(crate) fn child_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    fn recorder() -> (Arc<StdMutex<Vec<(String, ZkEvent)>>>, impl Fn() -> WatchCallback) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let s = seen.clone();
        let make = move || {
            let s = s.clone();
            WatchCallback::node(move |path, event| s.lock().unwrap().push((path, event)))
        };
        (seen, make)
    }

    async fn registry_with(entries: Vec<(WatchKind, &str, WatchCallback)>) -> WatcherRegistry {
        let registry = WatcherRegistry::new();
        {
            let mut w = registry.inner.lock().await;
            for (kind, path, cb) in entries {
                w.insert(kind, path, cb);
            }
        }
        registry
    }

    #[tokio::test]
    async fn created_fires_exists_watches_only() {
        let (seen, cb) = recorder();
        let registry = registry_with(vec![
            (WatchKind::Exists, "/a", cb()),
            (WatchKind::Data, "/a", cb()),
            (WatchKind::Children, "/a", cb()),
        ])
        .await;
        assert_eq!(registry.dispatch("/a", ZkEvent::NodeCreated).await, 1);
        assert_eq!(registry.pending(WatchKind::Exists, "/a").await, 0);
        assert_eq!(registry.pending(WatchKind::Data, "/a").await, 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("/a".to_string(), ZkEvent::NodeCreated)]
        );
    }

    #[tokio::test]
    async fn deleted_fires_every_kind() {
        let (seen, cb) = recorder();
        let registry = registry_with(vec![
            (WatchKind::Exists, "/a", cb()),
            (WatchKind::Data, "/a", cb()),
            (WatchKind::Data, "/a", cb()),
            (WatchKind::Children, "/a", cb()),
            (WatchKind::Data, "/b", cb()),
        ])
        .await;
        assert_eq!(registry.dispatch("/a", ZkEvent::NodeDeleted).await, 4);
        assert_eq!(seen.lock().unwrap().len(), 4);
        assert_eq!(registry.dispatch("/a", ZkEvent::NodeDeleted).await, 0);
        assert_eq!(registry.pending(WatchKind::Data, "/b").await, 1);
    }

    #[tokio::test]
    async fn changed_leaves_children_watches() {
        let (_seen, cb) = recorder();
        let registry = registry_with(vec![
            (WatchKind::Exists, "/a", cb()),
            (WatchKind::Data, "/a", cb()),
            (WatchKind::Children, "/a", cb()),
        ])
        .await;
        assert_eq!(registry.dispatch("/a", ZkEvent::NodeChanged).await, 2);
        assert_eq!(registry.pending(WatchKind::Children, "/a").await, 1);
        assert_eq!(registry.dispatch("/a", ZkEvent::ChildChanged).await, 1);
    }

    #[tokio::test]
    async fn close_reaches_everything_once() {
        let (seen, cb) = recorder();
        let (tx, rx) = oneshot::channel();
        let registry = registry_with(vec![
            (WatchKind::Exists, "/a", cb()),
            (WatchKind::Children, "/b", cb()),
            (WatchKind::Data, "/c", WatchCallback::Signal(tx)),
        ])
        .await;
        assert_eq!(registry.drain_and_close_all(ZkEvent::SessionClosed).await, 3);
        assert_eq!(rx.await, Ok(ZkEvent::SessionClosed));
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert!(seen
            .lock()
            .unwrap()
            .iter()
            .all(|(_, e)| *e == ZkEvent::SessionClosed));
        assert_eq!(registry.dispatch("/a", ZkEvent::NodeCreated).await, 0);
        assert_eq!(registry.drain_and_close_all(ZkEvent::SessionClosed).await, 0);
    }

    #[tokio::test]
    async fn children_callbacks_get_previous_listing() {
        let seen = Arc::new(StdMutex::new(None));
        let s = seen.clone();
        let callback = WatchCallback::Children {
            previous: vec!["/p/x".to_string()],
            callback: Box::new(move |path, event, previous| {
                *s.lock().unwrap() = Some((path, event, previous));
            }),
        };
        let registry = registry_with(vec![(WatchKind::Children, "/p", callback)]).await;
        registry.dispatch("/p", ZkEvent::ChildChanged).await;
        assert_eq!(
            *seen.lock().unwrap(),
            Some((
                "/p".to_string(),
                ZkEvent::ChildChanged,
                vec!["/p/x".to_string()]
            ))
        );
    }

    #[test]
    fn child_paths() {
        assert_eq!(child_path("/", "a"), "/a");
        assert_eq!(child_path("/a", "b"), "/a/b");
    }
}
