use crate::session::Session;
use crate::watcher::{child_path, WatchCallback};
use crate::{Acl, AclList, CreateMode, Stat, ZkError, ZkEvent, ZkResult};
use futures::future::BoxFuture;
use slog::{debug, warn};
use std::fmt;
use std::sync::Arc;

/// The largest node payload this client reads or writes.
pub const MAX_BUFFER_LEN: usize = 1024 * 1024;

/// What a mock node reads back.
pub const MOCK_CONTENT: &[u8] = b"/mock/";

#[derive(Clone)]
enum Backend {
    Session(Arc<Session>),
    /// Every operation succeeds, or fails with the given error.
    Mock(Option<ZkError>),
}

/// A handle on one znode of one session.
///
/// Nodes are cheap to clone and carry nothing but the path: all state lives on the server.
/// Dropping a node has no effect on the znode.
#[derive(Clone)]
pub struct Node {
    backend: Backend,
    path: String,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.backend {
            Backend::Session(ref s) => f
                .debug_struct("Node")
                .field("cluster", &s.name())
                .field("path", &self.path)
                .finish(),
            Backend::Mock(code) => f
                .debug_struct("Node")
                .field("mock", &code)
                .field("path", &self.path)
                .finish(),
        }
    }
}

/// Checks a path the way the server does. Sequential nodes may end in `/`, since the server
/// appends to them.
pub fn validate_path(path: &str, sequential: bool) -> ZkResult<()> {
    if !path.starts_with('/') || path.contains('\0') {
        return Err(ZkError::InvalidPath);
    }
    if path == "/" {
        return Ok(());
    }
    let body = if sequential && path.ends_with('/') {
        &path[1..path.len() - 1]
    } else {
        &path[1..]
    };
    for segment in body.split('/') {
        match segment {
            "" | "." | ".." => return Err(ZkError::InvalidPath),
            _ => {}
        }
    }
    Ok(())
}

fn parent_path(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(i) if i > 0 => Some(&path[..i]),
        _ => None,
    }
}

fn check_len(len: usize) -> ZkResult<()> {
    if len > MAX_BUFFER_LEN {
        Err(ZkError::InvalidData)
    } else {
        Ok(())
    }
}

impl Node {
    pub(crate) fn new(session: Arc<Session>, path: &str) -> Self {
        Node {
            backend: Backend::Session(session),
            path: path.to_string(),
        }
    }

    /// A node that never touches the network. Its operations all fail with `error`, or all
    /// succeed if there is none, reading back [`MOCK_CONTENT`].
    pub fn mock(path: &str, error: Option<ZkError>) -> Self {
        Node {
            backend: Backend::Mock(error),
            path: path.to_string(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The session this node belongs to, unless it is a mock.
    pub fn session(&self) -> Option<&Arc<Session>> {
        match self.backend {
            Backend::Session(ref s) => Some(s),
            Backend::Mock(_) => None,
        }
    }

    pub fn is_mock(&self) -> bool {
        matches!(self.backend, Backend::Mock(_))
    }

    /// The session to use, or the canned result of a mock.
    pub(crate) fn backend(&self) -> Result<&Arc<Session>, ZkResult<()>> {
        match self.backend {
            Backend::Session(ref s) => Ok(s),
            Backend::Mock(None) => Err(Ok(())),
            Backend::Mock(Some(e)) => Err(Err(e)),
        }
    }

    /// Creates this node with an open ACL. For sequential modes the node's path becomes the one
    /// the server assigned.
    pub async fn create(&mut self, data: &[u8], mode: CreateMode) -> ZkResult<()> {
        let session = match self.backend() {
            Ok(s) => s.clone(),
            Err(r) => return r,
        };
        let path = session
            .create(&self.path, data, Acl::open_unsafe(), mode)
            .await?;
        self.path = path;
        Ok(())
    }

    /// Creates this node, first creating any missing ancestors with no data.
    ///
    /// Nodes that already exist (or appear concurrently) count as created, the node itself
    /// included; its data is then left as it is.
    pub async fn recursive_create(&mut self, data: &[u8], mode: CreateMode) -> ZkResult<()> {
        validate_path(&self.path, mode.is_sequential())?;
        let session = match self.backend() {
            Ok(s) => s.clone(),
            Err(r) => return r,
        };
        if self.path == "/" {
            return Ok(());
        }
        let parent = parent_path(&self.path).ok_or(ZkError::InvalidPath)?;

        // walk up to the deepest ancestor that exists
        let mut missing = Vec::new();
        let mut cursor = Some(parent);
        while let Some(p) = cursor {
            if p == "/" {
                break;
            }
            match session.exists(p).await {
                Ok(_) => break,
                Err(ZkError::NoNode) => {
                    missing.push(p.to_string());
                    cursor = parent_path(p);
                }
                Err(e) => return Err(e),
            }
        }
        for ancestor in missing.iter().rev() {
            match session
                .create(ancestor, b"", Acl::open_unsafe(), CreateMode::Persistent)
                .await
            {
                Ok(_) | Err(ZkError::NodeExists) => {
                    debug!(session.logger(), "created ancestor"; "path" => ancestor);
                }
                Err(e) => return Err(e),
            }
        }

        match session
            .create(&self.path, data, Acl::open_unsafe(), mode)
            .await
        {
            Ok(path) => self.path = path,
            Err(ZkError::NodeExists) => {
                debug!(session.logger(), "node already exists"; "path" => &self.path);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    pub async fn get_content(&self) -> ZkResult<Vec<u8>> {
        self.get_content_with_stat().await.map(|(data, _)| data)
    }

    /// The node's data and stat. Data larger than [`MAX_BUFFER_LEN`] is an `InvalidData` error.
    pub async fn get_content_with_stat(&self) -> ZkResult<(Vec<u8>, Stat)> {
        let session = match self.backend() {
            Ok(s) => s,
            Err(r) => return r.map(|_| (MOCK_CONTENT.to_vec(), Stat::default())),
        };
        let (data, stat) = session.get(&self.path).await?;
        check_len(data.len())?;
        Ok((data, stat))
    }

    /// Reads the node and arms a data watch; `callback` runs once, on the next change or
    /// deletion of the node, or with [`ZkEvent::SessionClosed`] if the session closes first.
    pub async fn watch_content<F>(&self, callback: F) -> ZkResult<Vec<u8>>
    where
        F: FnOnce(String, ZkEvent) + Send + 'static,
    {
        let session = match self.backend() {
            Ok(s) => s,
            Err(r) => return r.map(|_| MOCK_CONTENT.to_vec()),
        };
        let (data, _) = session
            .watcher_registry()
            .register_data_watch(session, &self.path, WatchCallback::node(callback))
            .await
            .map_err(|(e, _)| e)?;
        Ok(data)
    }

    /// Replaces the node's data. A payload of [`MAX_BUFFER_LEN`] bytes or more is refused
    /// without contacting the server.
    pub async fn set_content(&self, data: &[u8], version: i32) -> ZkResult<()> {
        if data.len() >= MAX_BUFFER_LEN {
            return Err(ZkError::InvalidData);
        }
        let session = match self.backend() {
            Ok(s) => s,
            Err(r) => return r,
        };
        session.set(&self.path, data, version).await.map(|_| ())
    }

    /// The node's stat, or `NoNode`.
    pub async fn exists(&self) -> ZkResult<Stat> {
        let session = match self.backend() {
            Ok(s) => s,
            Err(r) => return r.map(|_| Stat::default()),
        };
        session.exists(&self.path).await
    }

    /// Like [`Node::exists`], arming a watch that fires when the node is created, changed or
    /// deleted. The watch is armed even when the result is `NoNode`.
    pub async fn watch_exists<F>(&self, callback: F) -> ZkResult<Stat>
    where
        F: FnOnce(String, ZkEvent) + Send + 'static,
    {
        let session = match self.backend() {
            Ok(s) => s,
            Err(r) => return r.map(|_| Stat::default()),
        };
        session
            .watcher_registry()
            .register_exists_watch(session, &self.path, WatchCallback::node(callback))
            .await
            .map_err(|(e, _)| e)?
    }

    pub async fn delete(&self, version: i32) -> ZkResult<()> {
        let session = match self.backend() {
            Ok(s) => s,
            Err(r) => return r,
        };
        session.delete(&self.path, version).await
    }

    /// Deletes this node and everything below it.
    ///
    /// Nodes that disappear while this runs count as deleted. A pass over the children that
    /// fails is repeated, as often as the session retries requests.
    pub async fn recursive_delete(&self) -> ZkResult<()> {
        let session = match self.backend() {
            Ok(s) => s,
            Err(r) => return r,
        };
        delete_subtree(session, self.path.clone()).await
    }

    fn child(&self, name: &str) -> String {
        child_path(&self.path, name)
    }

    /// The data of the child called `name`.
    pub async fn get_child_content(&self, name: &str) -> ZkResult<Vec<u8>> {
        let session = match self.backend() {
            Ok(s) => s,
            Err(r) => return r.map(|_| MOCK_CONTENT.to_vec()),
        };
        let (data, _) = session.get(&self.child(name)).await?;
        check_len(data.len())?;
        Ok(data)
    }

    /// Replaces the data of the child called `name`, with the same size limit as
    /// [`Node::set_content`].
    pub async fn set_child_content(&self, name: &str, data: &[u8], version: i32) -> ZkResult<()> {
        if data.len() >= MAX_BUFFER_LEN {
            return Err(ZkError::InvalidData);
        }
        let session = match self.backend() {
            Ok(s) => s,
            Err(r) => return r,
        };
        session
            .set(&self.child(name), data, version)
            .await
            .map(|_| ())
    }

    /// The full paths of this node's children.
    pub async fn children(&self) -> ZkResult<Vec<String>> {
        let session = match self.backend() {
            Ok(s) => s,
            Err(r) => return r.map(|_| Vec::new()),
        };
        let names = session.get_children(&self.path).await?;
        Ok(names.iter().map(|n| self.child(n)).collect())
    }

    /// Like [`Node::children`], arming a watch that fires when a child is added or removed, or
    /// the node is deleted. The callback gets the listing returned here as its third argument.
    pub async fn watch_children<F>(&self, callback: F) -> ZkResult<Vec<String>>
    where
        F: FnOnce(String, ZkEvent, Vec<String>) + Send + 'static,
    {
        let session = match self.backend() {
            Ok(s) => s,
            Err(r) => return r.map(|_| Vec::new()),
        };
        let names = session
            .watcher_registry()
            .register_children_watch(session, &self.path, WatchCallback::children(callback))
            .await
            .map_err(|(e, _)| e)?;
        Ok(names.iter().map(|n| self.child(n)).collect())
    }

    pub async fn get_acl(&self) -> ZkResult<(AclList, Stat)> {
        let session = match self.backend() {
            Ok(s) => s,
            Err(r) => return r.map(|_| (AclList::new(), Stat::default())),
        };
        let (acl, stat) = session.get_acl(&self.path).await?;
        Ok((AclList::from(acl), stat))
    }

    pub async fn set_acl(&self, acl: &AclList, version: i32) -> ZkResult<()> {
        let session = match self.backend() {
            Ok(s) => s,
            Err(r) => return r,
        };
        session
            .set_acl(&self.path, acl.as_slice(), version)
            .await
            .map(|_| ())
    }
}

fn delete_subtree(session: &Session, path: String) -> BoxFuture<'_, ZkResult<()>> {
    Box::pin(async move {
        let mut result = Ok(());
        for _ in 0..=session.options().max_retries {
            let children = match session.get_children(&path).await {
                Ok(children) => children,
                Err(ZkError::NoNode) => {
                    warn!(session.logger(), "node vanished while deleting it"; "path" => &path);
                    return Ok(());
                }
                Err(e) => {
                    result = Err(e);
                    continue;
                }
            };
            result = Ok(());
            for child in children {
                if let Err(e) = delete_subtree(session, child_path(&path, &child)).await {
                    result = Err(e);
                    break;
                }
            }
            if result.is_ok() {
                break;
            }
        }
        result?;
        match session.delete(&path, -1).await {
            Ok(()) | Err(ZkError::NoNode) => Ok(()),
            Err(e) => Err(e),
        }
    })
}
