//! An in-process ensemble.
//!
//! [`MemoryEnsemble`] keeps a znode tree in memory and serves any number of sessions through the
//! [`Connector`]/[`Transport`] traits, with the server-side behavior the session layer relies on:
//! versions, ephemeral and sequential nodes, one-shot data and child watches, session expiry.
//! It also lets tests inject faults, cut connectivity, and count the requests it served.

use super::{Connector, EventSender, Transport};
use crate::{Acl, CreateMode, KeeperState, Stat, WatchedEvent, WatchedEventType, ZkError, ZkResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const FIRST_SESSION_ID: i64 = 0x1_6a3c_0000_0000;

/// A request kind, for fault injection and call counting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    AddAuth,
    Create,
    Delete,
    Exists,
    GetData,
    SetData,
    GetChildren,
    GetAcl,
    SetAcl,
}

/// What an injected fault does when it triggers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FaultAction {
    /// The request fails with this error without touching the tree.
    Fail(ZkError),
    /// Another actor removes the request's target (and its subtree) right before the request
    /// is served.
    Vanish,
}

/// A fault that applies to the next matching requests.
#[derive(Clone, Debug)]
pub struct Fault {
    op: Op,
    path: Option<String>,
    action: FaultAction,
    remaining: usize,
}

impl Fault {
    /// The next `op` request fails with `error`.
    pub fn fail(op: Op, error: ZkError) -> Self {
        Fault {
            op,
            path: None,
            action: FaultAction::Fail(error),
            remaining: 1,
        }
    }

    /// The node at `path` disappears right before the next `op` request against it.
    pub fn vanish(op: Op, path: &str) -> Self {
        Fault {
            op,
            path: Some(path.to_string()),
            action: FaultAction::Vanish,
            remaining: 1,
        }
    }

    /// Only requests against `path` trigger this fault.
    pub fn on_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    /// Triggers for the next `n` matching requests.
    pub fn times(mut self, n: usize) -> Self {
        self.remaining = n;
        self
    }

    /// Triggers for every matching request.
    pub fn always(self) -> Self {
        self.times(usize::MAX)
    }

    fn matches(&self, op: Op, path: &str) -> bool {
        self.remaining > 0 && self.op == op && self.path.as_deref().map_or(true, |p| p == path)
    }
}

#[derive(Debug)]
struct ZNode {
    data: Vec<u8>,
    acl: Vec<Acl>,
    stat: Stat,
}

#[derive(Debug)]
struct SessionEntry {
    events: EventSender,
    state: KeeperState,
    auth: Vec<(String, Vec<u8>)>,
}

#[derive(Debug)]
struct EnsembleState {
    nodes: BTreeMap<String, ZNode>,
    sessions: HashMap<i64, SessionEntry>,
    /// Watches left by `exists` and `get_data` (path -> sessions).
    data_watches: HashMap<String, HashSet<i64>>,
    /// Watches left by `get_children` (path -> sessions).
    child_watches: HashMap<String, HashSet<i64>>,
    zxid: i64,
    next_session_id: i64,
    reachable: bool,
    faults: Vec<Fault>,
    calls: HashMap<Op, usize>,
    connects: usize,
}

/// An in-memory ZooKeeper ensemble. Clones share the same tree.
#[derive(Clone, Debug)]
pub struct MemoryEnsemble {
    state: Arc<Mutex<EnsembleState>>,
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(i) if i > 0 => Some(&path[..i]),
        _ => None,
    }
}

fn is_child_of(parent: &str, candidate: &str) -> bool {
    if candidate == "/" {
        return false;
    }
    parent_of(candidate) == Some(parent)
}

impl MemoryEnsemble {
    /// Creates an ensemble holding only the root node.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            ZNode {
                data: Vec::new(),
                acl: Acl::open_unsafe().to_vec(),
                stat: Stat::default(),
            },
        );
        MemoryEnsemble {
            state: Arc::new(Mutex::new(EnsembleState {
                nodes,
                sessions: HashMap::new(),
                data_watches: HashMap::new(),
                child_watches: HashMap::new(),
                zxid: 0,
                next_session_id: FIRST_SESSION_ID,
                reachable: true,
                faults: Vec::new(),
                calls: HashMap::new(),
                connects: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EnsembleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues a fault. Faults are consulted in insertion order.
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    /// Drops every pending fault.
    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// How many `op` requests have been received, including failed ones.
    pub fn calls(&self, op: Op) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// How many sessions have been opened.
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    /// Ids of the sessions currently known to the ensemble.
    pub fn session_ids(&self) -> Vec<i64> {
        let mut ids: Vec<_> = self.lock().sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Whether a node exists at `path`.
    pub fn contains(&self, path: &str) -> bool {
        self.lock().nodes.contains_key(path)
    }

    /// The data of the node at `path`.
    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().nodes.get(path).map(|n| n.data.clone())
    }

    /// The sorted child names of the node at `path`.
    pub fn children(&self, path: &str) -> Vec<String> {
        self.lock().child_names(path)
    }

    /// Removes the node at `path` and everything below it, as another client would.
    pub fn remove(&self, path: &str) {
        self.lock().remove_subtree(path);
    }

    /// Makes the ensemble unreachable (or reachable again).
    ///
    /// While unreachable, connected sessions are told they are disconnected, requests fail with
    /// `ConnectionLoss`, and new sessions never complete their handshake. Becoming reachable
    /// again reconnects every waiting session.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.lock();
        if state.reachable == reachable {
            return;
        }
        state.reachable = reachable;
        let (from, to) = if reachable {
            (KeeperState::Disconnected, KeeperState::SyncConnected)
        } else {
            (KeeperState::SyncConnected, KeeperState::Disconnected)
        };
        for session in state.sessions.values_mut() {
            if session.state == from {
                session.state = to;
                let _ = session.events.unbounded_send(WatchedEvent::session(to));
            }
        }
    }

    /// Expires a session the way the server does when it stops hearing from a client: its
    /// ephemeral nodes and watches are removed and it is sent an expiry event.
    pub fn expire_session(&self, session_id: i64) -> bool {
        let mut state = self.lock();
        if !state.sessions.contains_key(&session_id) {
            return false;
        }
        state.drop_session_resources(session_id);
        if let Some(session) = state.sessions.get_mut(&session_id) {
            session.state = KeeperState::Expired;
            let _ = session
                .events
                .unbounded_send(WatchedEvent::session(KeeperState::Expired));
        }
        true
    }

    /// Sends an arbitrary state transition to a session without changing anything else.
    pub fn notify_session(&self, session_id: i64, keeper_state: KeeperState) -> bool {
        let state = self.lock();
        match state.sessions.get(&session_id) {
            Some(session) => {
                let _ = session
                    .events
                    .unbounded_send(WatchedEvent::session(keeper_state));
                true
            }
            None => false,
        }
    }

    /// The authentication entries a session has added.
    pub fn auth_of(&self, session_id: i64) -> Vec<(String, Vec<u8>)> {
        self.lock()
            .sessions
            .get(&session_id)
            .map(|s| s.auth.clone())
            .unwrap_or_default()
    }
}

impl EnsembleState {
    fn next_zxid(&mut self) -> i64 {
        self.zxid += 1;
        self.zxid
    }

    fn child_names(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| is_child_of(path, k))
            .map(|(k, _)| k[prefix.len()..].to_string())
            .collect()
    }

    fn send(&self, session_id: i64, event: WatchedEvent) {
        if let Some(session) = self.sessions.get(&session_id) {
            let _ = session.events.unbounded_send(event);
        }
    }

    fn trigger(&mut self, child_watch: bool, path: &str, event_type: WatchedEventType) {
        let watches = if child_watch {
            &mut self.child_watches
        } else {
            &mut self.data_watches
        };
        if let Some(sessions) = watches.remove(path) {
            for id in sessions {
                self.send(id, WatchedEvent::node(event_type, path));
            }
        }
    }

    fn add_watch(&mut self, child_watch: bool, path: &str, session_id: i64) {
        let watches = if child_watch {
            &mut self.child_watches
        } else {
            &mut self.data_watches
        };
        watches
            .entry(path.to_string())
            .or_insert_with(HashSet::new)
            .insert(session_id);
    }

    fn take_fault(&mut self, op: Op, path: &str) -> Option<FaultAction> {
        let fault = self.faults.iter_mut().find(|f| f.matches(op, path))?;
        if fault.remaining != usize::MAX {
            fault.remaining -= 1;
        }
        let action = fault.action.clone();
        self.faults.retain(|f| f.remaining > 0);
        Some(action)
    }

    fn remove_node(&mut self, path: &str) {
        if self.nodes.remove(path).is_none() {
            return;
        }
        let zxid = self.next_zxid();
        if let Some(parent) = parent_of(path) {
            if let Some(p) = self.nodes.get_mut(parent) {
                p.stat.cversion += 1;
                p.stat.num_children -= 1;
                p.stat.pzxid = zxid;
            }
            self.trigger(false, path, WatchedEventType::NodeDeleted);
            self.trigger(true, path, WatchedEventType::NodeDeleted);
            self.trigger(true, parent, WatchedEventType::NodeChildrenChanged);
        }
    }

    fn remove_subtree(&mut self, path: &str) {
        let prefix = format!("{}/", path);
        let mut doomed: Vec<String> = self
            .nodes
            .keys()
            .filter(|k| *k == path || (path != "/" && k.starts_with(&prefix)))
            .cloned()
            .collect();
        // deepest first, so that parents are empty when they go
        doomed.sort_by(|a, b| b.len().cmp(&a.len()));
        for p in doomed {
            self.remove_node(&p);
        }
    }

    fn drop_session_resources(&mut self, session_id: i64) {
        for sessions in self.data_watches.values_mut() {
            sessions.remove(&session_id);
        }
        for sessions in self.child_watches.values_mut() {
            sessions.remove(&session_id);
        }
        self.data_watches.retain(|_, s| !s.is_empty());
        self.child_watches.retain(|_, s| !s.is_empty());

        let ephemerals: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.stat.ephemeral_owner == session_id)
            .map(|(k, _)| k.clone())
            .collect();
        for path in ephemerals {
            self.remove_node(&path);
        }
    }

    fn create(
        &mut self,
        session_id: i64,
        path: &str,
        data: &[u8],
        acl: &[Acl],
        mode: CreateMode,
    ) -> ZkResult<String> {
        if !path.starts_with('/') || path == "/" {
            return Err(ZkError::BadArguments);
        }
        if acl.is_empty() {
            return Err(ZkError::InvalidAcl);
        }
        let parent = parent_of(path).ok_or(ZkError::BadArguments)?.to_string();
        let parent_node = self.nodes.get(&parent).ok_or(ZkError::NoNode)?;
        if parent_node.stat.ephemeral_owner != 0 {
            return Err(ZkError::NoChildrenForEphemerals);
        }
        let name = if mode.is_sequential() {
            format!("{}{:010}", path, parent_node.stat.cversion)
        } else {
            if path.ends_with('/') {
                return Err(ZkError::BadArguments);
            }
            path.to_string()
        };
        if self.nodes.contains_key(&name) {
            return Err(ZkError::NodeExists);
        }

        let zxid = self.next_zxid();
        let now = now_millis();
        let stat = Stat {
            czxid: zxid,
            mzxid: zxid,
            ctime: now,
            mtime: now,
            ephemeral_owner: if mode.is_ephemeral() { session_id } else { 0 },
            data_length: data.len() as i32,
            pzxid: zxid,
            ..Stat::default()
        };
        self.nodes.insert(
            name.clone(),
            ZNode {
                data: data.to_vec(),
                acl: acl.to_vec(),
                stat,
            },
        );
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.stat.cversion += 1;
            p.stat.num_children += 1;
            p.stat.pzxid = zxid;
        }
        self.trigger(false, &name, WatchedEventType::NodeCreated);
        self.trigger(true, &parent, WatchedEventType::NodeChildrenChanged);
        Ok(name)
    }

    fn delete(&mut self, path: &str, version: i32) -> ZkResult<()> {
        if path == "/" {
            return Err(ZkError::BadArguments);
        }
        let node = self.nodes.get(path).ok_or(ZkError::NoNode)?;
        if version != -1 && version != node.stat.version {
            return Err(ZkError::BadVersion);
        }
        if node.stat.num_children > 0 {
            return Err(ZkError::NotEmpty);
        }
        self.remove_node(path);
        Ok(())
    }

    fn set_data(&mut self, path: &str, data: &[u8], version: i32) -> ZkResult<Stat> {
        let zxid = self.zxid + 1;
        let node = self.nodes.get_mut(path).ok_or(ZkError::NoNode)?;
        if version != -1 && version != node.stat.version {
            return Err(ZkError::BadVersion);
        }
        node.data = data.to_vec();
        node.stat.version += 1;
        node.stat.mzxid = zxid;
        node.stat.mtime = now_millis();
        node.stat.data_length = data.len() as i32;
        let stat = node.stat;
        self.zxid = zxid;
        self.trigger(false, path, WatchedEventType::NodeDataChanged);
        Ok(stat)
    }

    fn set_acl(&mut self, path: &str, acl: &[Acl], version: i32) -> ZkResult<Stat> {
        if acl.is_empty() {
            return Err(ZkError::InvalidAcl);
        }
        let node = self.nodes.get_mut(path).ok_or(ZkError::NoNode)?;
        if version != -1 && version != node.stat.aversion {
            return Err(ZkError::BadVersion);
        }
        node.acl = acl.to_vec();
        node.stat.aversion += 1;
        Ok(node.stat)
    }
}

#[async_trait]
impl Connector for MemoryEnsemble {
    async fn connect(
        &self,
        hosts: &[String],
        _session_timeout: Duration,
        events: EventSender,
    ) -> ZkResult<Arc<dyn Transport>> {
        if hosts.is_empty() {
            return Err(ZkError::BadArguments);
        }
        let mut state = self.lock();
        state.connects += 1;
        let session_id = state.next_session_id;
        state.next_session_id += 1;

        let keeper_state = if state.reachable {
            let _ = events.unbounded_send(WatchedEvent::session(KeeperState::SyncConnected));
            KeeperState::SyncConnected
        } else {
            KeeperState::Disconnected
        };
        state.sessions.insert(
            session_id,
            SessionEntry {
                events,
                state: keeper_state,
                auth: Vec::new(),
            },
        );
        Ok(Arc::new(MemoryTransport {
            ensemble: self.clone(),
            session_id,
        }))
    }
}

/// One session on a [`MemoryEnsemble`]. Dropping it closes the session.
#[derive(Debug)]
pub struct MemoryTransport {
    ensemble: MemoryEnsemble,
    session_id: i64,
}

impl MemoryTransport {
    fn serve<T, F>(&self, op: Op, path: &str, f: F) -> ZkResult<T>
    where
        F: FnOnce(&mut EnsembleState, i64) -> ZkResult<T>,
    {
        let mut state = self.ensemble.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        match state.sessions.get(&self.session_id).map(|s| s.state) {
            None | Some(KeeperState::Expired) => return Err(ZkError::SessionExpired),
            Some(KeeperState::AuthFailed) => return Err(ZkError::AuthFailed),
            Some(s) if !s.is_connected() => return Err(ZkError::ConnectionLoss),
            Some(_) => {}
        }
        match state.take_fault(op, path) {
            Some(FaultAction::Fail(e)) => return Err(e),
            Some(FaultAction::Vanish) => state.remove_subtree(path),
            None => {}
        }
        f(&mut *state, self.session_id)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let mut state = self.ensemble.lock();
        state.drop_session_resources(self.session_id);
        state.sessions.remove(&self.session_id);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn session_id(&self) -> i64 {
        self.session_id
    }

    fn state(&self) -> KeeperState {
        self.ensemble
            .lock()
            .sessions
            .get(&self.session_id)
            .map(|s| s.state)
            .unwrap_or(KeeperState::Expired)
    }

    async fn add_auth(&self, scheme: &str, auth: &[u8]) -> ZkResult<()> {
        let scheme = scheme.to_string();
        let auth = auth.to_vec();
        self.serve(Op::AddAuth, "", move |state, id| {
            if scheme == "digest" && !auth.contains(&b':') {
                return Err(ZkError::AuthFailed);
            }
            if let Some(session) = state.sessions.get_mut(&id) {
                session.auth.push((scheme, auth));
            }
            Ok(())
        })
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        acl: &[Acl],
        mode: CreateMode,
    ) -> ZkResult<String> {
        self.serve(Op::Create, path, |state, id| {
            state.create(id, path, data, acl, mode)
        })
    }

    async fn delete(&self, path: &str, version: i32) -> ZkResult<()> {
        self.serve(Op::Delete, path, |state, _| state.delete(path, version))
    }

    async fn exists(&self, path: &str, watch: bool) -> ZkResult<Stat> {
        self.serve(Op::Exists, path, |state, id| {
            if watch {
                // exists watches are left behind even when the node is missing
                state.add_watch(false, path, id);
            }
            state.nodes.get(path).map(|n| n.stat).ok_or(ZkError::NoNode)
        })
    }

    async fn get_data(&self, path: &str, watch: bool) -> ZkResult<(Vec<u8>, Stat)> {
        self.serve(Op::GetData, path, |state, id| {
            let found = state
                .nodes
                .get(path)
                .map(|n| (n.data.clone(), n.stat))
                .ok_or(ZkError::NoNode)?;
            if watch {
                state.add_watch(false, path, id);
            }
            Ok(found)
        })
    }

    async fn set_data(&self, path: &str, data: &[u8], version: i32) -> ZkResult<Stat> {
        self.serve(Op::SetData, path, |state, _| {
            state.set_data(path, data, version)
        })
    }

    async fn get_children(&self, path: &str, watch: bool) -> ZkResult<Vec<String>> {
        self.serve(Op::GetChildren, path, |state, id| {
            if !state.nodes.contains_key(path) {
                return Err(ZkError::NoNode);
            }
            if watch {
                state.add_watch(true, path, id);
            }
            Ok(state.child_names(path))
        })
    }

    async fn get_acl(&self, path: &str) -> ZkResult<(Vec<Acl>, Stat)> {
        self.serve(Op::GetAcl, path, |state, _| {
            state
                .nodes
                .get(path)
                .map(|n| (n.acl.clone(), n.stat))
                .ok_or(ZkError::NoNode)
        })
    }

    async fn set_acl(&self, path: &str, acl: &[Acl], version: i32) -> ZkResult<Stat> {
        self.serve(Op::SetAcl, path, |state, _| state.set_acl(path, acl, version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use futures::StreamExt;

    async fn open(ensemble: &MemoryEnsemble) -> (Arc<dyn Transport>, mpsc::UnboundedReceiver<WatchedEvent>) {
        let (tx, mut rx) = mpsc::unbounded();
        let t = ensemble
            .connect(&["127.0.0.1:2181".to_string()], Duration::from_secs(4), tx)
            .await
            .unwrap();
        assert_eq!(
            rx.next().await,
            Some(WatchedEvent::session(KeeperState::SyncConnected))
        );
        (t, rx)
    }

    #[tokio::test]
    async fn sequential_nodes_are_zero_padded() {
        let ensemble = MemoryEnsemble::new();
        let (zk, _rx) = open(&ensemble).await;
        let acl = Acl::open_unsafe();
        zk.create("/locks", b"", acl, CreateMode::Persistent).await.unwrap();
        let a = zk
            .create("/locks/n-", b"", acl, CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let b = zk
            .create("/locks/n-", b"", acl, CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert_eq!(a, "/locks/n-0000000000");
        assert_eq!(b, "/locks/n-0000000001");
        assert_eq!(ensemble.children("/locks"), vec!["n-0000000000", "n-0000000001"]);
    }

    #[tokio::test]
    async fn ephemerals_go_with_their_session() {
        let ensemble = MemoryEnsemble::new();
        let (zk, _rx) = open(&ensemble).await;
        zk.create("/e", b"x", Acl::open_unsafe(), CreateMode::Ephemeral)
            .await
            .unwrap();
        assert_eq!(
            zk.create("/e/child", b"", Acl::open_unsafe(), CreateMode::Persistent)
                .await,
            Err(ZkError::NoChildrenForEphemerals)
        );
        assert!(ensemble.contains("/e"));
        drop(zk);
        assert!(!ensemble.contains("/e"));
        assert!(ensemble.session_ids().is_empty());
    }

    #[tokio::test]
    async fn watches_fire_once() {
        let ensemble = MemoryEnsemble::new();
        let (zk, mut rx) = open(&ensemble).await;
        assert_eq!(zk.exists("/w", true).await, Err(ZkError::NoNode));
        zk.create("/w", b"1", Acl::open_unsafe(), CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(
            rx.next().await,
            Some(WatchedEvent::node(WatchedEventType::NodeCreated, "/w"))
        );

        zk.get_data("/w", true).await.unwrap();
        zk.set_data("/w", b"2", -1).await.unwrap();
        zk.set_data("/w", b"3", -1).await.unwrap();
        assert_eq!(
            rx.next().await,
            Some(WatchedEvent::node(WatchedEventType::NodeDataChanged, "/w"))
        );
        // the second set found no watch
        zk.get_children("/", true).await.unwrap();
        zk.delete("/w", -1).await.unwrap();
        assert_eq!(
            rx.next().await,
            Some(WatchedEvent::node(WatchedEventType::NodeChildrenChanged, "/"))
        );
    }

    #[tokio::test]
    async fn versions_are_checked() {
        let ensemble = MemoryEnsemble::new();
        let (zk, _rx) = open(&ensemble).await;
        zk.create("/v", b"", Acl::open_unsafe(), CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(zk.set_data("/v", b"a", 3).await, Err(ZkError::BadVersion));
        let stat = zk.set_data("/v", b"a", 0).await.unwrap();
        assert_eq!(stat.version, 1);
        assert_eq!(zk.delete("/v", 0).await, Err(ZkError::BadVersion));
        zk.delete("/v", 1).await.unwrap();
    }

    #[tokio::test]
    async fn faults_apply_in_order() {
        let ensemble = MemoryEnsemble::new();
        let (zk, _rx) = open(&ensemble).await;
        ensemble.inject(Fault::fail(Op::Exists, ZkError::ConnectionLoss).times(2));
        assert_eq!(zk.exists("/", false).await, Err(ZkError::ConnectionLoss));
        assert_eq!(zk.exists("/", false).await, Err(ZkError::ConnectionLoss));
        assert!(zk.exists("/", false).await.is_ok());
        assert_eq!(ensemble.calls(Op::Exists), 3);

        zk.create("/gone", b"", Acl::open_unsafe(), CreateMode::Persistent)
            .await
            .unwrap();
        ensemble.inject(Fault::vanish(Op::GetData, "/gone"));
        assert_eq!(zk.get_data("/gone", false).await, Err(ZkError::NoNode));
    }

    #[tokio::test]
    async fn expiry_and_reachability() {
        let ensemble = MemoryEnsemble::new();
        let (zk, mut rx) = open(&ensemble).await;

        ensemble.set_reachable(false);
        assert_eq!(
            rx.next().await,
            Some(WatchedEvent::session(KeeperState::Disconnected))
        );
        assert_eq!(zk.exists("/", false).await, Err(ZkError::ConnectionLoss));
        ensemble.set_reachable(true);
        assert_eq!(
            rx.next().await,
            Some(WatchedEvent::session(KeeperState::SyncConnected))
        );

        assert!(ensemble.expire_session(zk.session_id()));
        assert_eq!(
            rx.next().await,
            Some(WatchedEvent::session(KeeperState::Expired))
        );
        assert_eq!(zk.state(), KeeperState::Expired);
        assert_eq!(zk.exists("/", false).await, Err(ZkError::SessionExpired));
    }
}
