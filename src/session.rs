//! One logical connection to an ensemble.
//!
//! A [`Session`] owns the transport handle for its cluster, serializes every request issued
//! through it, retries the transient failures, and keeps the session alive across expiry by
//! reconnecting. Events pushed by the server are consumed by one dispatcher task per connection:
//! state transitions drive the session itself, node events are handed to the session's
//! [`WatcherRegistry`].

use crate::node::Node;
use crate::resolver::Resolve;
use crate::transport::{Connector, EventReceiver, Transport};
use crate::watcher::WatcherRegistry;
use crate::{Acl, CreateMode, Stat, ZkError, ZkEvent, ZkResult};
use futures::channel::{mpsc, oneshot};
use futures::future::BoxFuture;
use futures::{Future, StreamExt};
use slog::{debug, error, info, o, trace, warn, Logger};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;

/// Receives every session state change: the cluster name and the event.
pub type SessionEventHandler = Arc<dyn Fn(String, ZkEvent) + Send + Sync + 'static>;

/// Where a session is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// Not connected, and not trying to be.
    Init,
    /// A handshake is in flight.
    Connecting,
    /// Requests can be served.
    Connected,
    /// The server gave up on this session; a new one is being established.
    Expired,
}

/// The settings a session is created with.
#[derive(Clone)]
pub struct SessionOptions {
    /// How long to wait for the handshake; also the requested server session timeout.
    pub timeout: Duration,
    /// A `user:password` pair to authenticate with once connected. Empty for none.
    pub credential: String,
    /// Refuse every request that would change the tree or arm a watch.
    pub read_only: bool,
    /// How many times a request failing with a transient error is retried.
    pub max_retries: usize,
    /// Pause between two attempts of the same request.
    pub retry_backoff: Duration,
    /// Upper bound on how long a blocked lock waits on its precursor before looking again.
    pub lock_poll_interval: Duration,
    /// Told about every session state change, along with the session's cluster name. Called on
    /// the dispatcher task, so it should return quickly.
    pub event_handler: Option<SessionEventHandler>,
    /// Where the session logs. Each session adds its cluster name as a `cluster` key. Discards
    /// everything by default.
    pub logger: Logger,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            timeout: Duration::from_millis(4000),
            credential: String::new(),
            read_only: false,
            max_retries: 3,
            retry_backoff: Duration::from_millis(0),
            lock_poll_interval: Duration::from_secs(10),
            event_handler: None,
            logger: Logger::root(slog::Discard, o!()),
        }
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("timeout", &self.timeout)
            .field("read_only", &self.read_only)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff", &self.retry_backoff)
            .field("lock_poll_interval", &self.lock_poll_interval)
            .finish()
    }
}

/// Whether a request changes the tree (or arms a watch), which read-only sessions refuse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

struct State {
    status: SessionStatus,
    handle: Option<Arc<dyn Transport>>,
    id: String,
    credential: String,
    connect_waiter: Option<oneshot::Sender<()>>,
}

/// A session with one cluster.
pub struct Session {
    name: String,
    options: SessionOptions,
    connector: Arc<dyn Connector>,
    resolver: Arc<dyn Resolve>,
    state: Mutex<State>,
    /// Bumped (under `state`) whenever the handle is replaced or dropped. Events from older
    /// connections are ignored.
    epoch: AtomicU64,
    registry: WatcherRegistry,
    logger: Logger,
    me: Weak<Session>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

impl Session {
    /// Creates a session for `name`. Nothing is connected until [`Session::connect`].
    pub fn new(
        name: &str,
        options: SessionOptions,
        connector: Arc<dyn Connector>,
        resolver: Arc<dyn Resolve>,
    ) -> Arc<Self> {
        let logger = options.logger.new(o!("cluster" => name.to_string()));
        Arc::new_cyclic(|me| Session {
            name: name.to_string(),
            state: Mutex::new(State {
                status: SessionStatus::Init,
                handle: None,
                id: String::new(),
                credential: options.credential.clone(),
                connect_waiter: None,
            }),
            options,
            connector,
            resolver,
            epoch: AtomicU64::new(0),
            registry: WatcherRegistry::new(),
            logger,
            me: me.clone(),
        })
    }

    /// Connects to the cluster, waiting until the server has accepted the session.
    ///
    /// Returns immediately if the session is already connecting or connected. An expired session
    /// is closed first.
    pub async fn connect(&self) -> ZkResult<()> {
        if self.status().await == SessionStatus::Expired {
            self.close().await;
        }

        let (epoch, waiter) = {
            let mut state = self.state.lock().await;
            if let SessionStatus::Connecting | SessionStatus::Connected = state.status {
                return Ok(());
            }
            state.status = SessionStatus::Connecting;

            let address = match self.resolver.resolve(&self.name).await {
                Ok(address) if !address.hosts.is_empty() => address,
                Ok(_) | Err(_) => {
                    warn!(self.logger, "no address for cluster");
                    state.status = SessionStatus::Init;
                    return Err(ZkError::DnsFailure);
                }
            };
            debug!(self.logger, "connecting"; "hosts" => address.connect_string());

            let (tx, rx) = mpsc::unbounded();
            let handle = match self
                .connector
                .connect(&address.hosts, self.options.timeout, tx)
                .await
            {
                Ok(handle) => handle,
                Err(e) => {
                    error!(self.logger, "failed to start session: {}", e);
                    state.status = SessionStatus::Init;
                    return Err(e);
                }
            };
            let (waiter_tx, waiter_rx) = oneshot::channel();
            state.connect_waiter = Some(waiter_tx);
            state.handle = Some(handle);
            let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::spawn(dispatch(self.me.clone(), epoch, rx, self.logger.clone()));
            (epoch, waiter_rx)
        };

        match tokio::time::timeout(self.options.timeout, waiter).await {
            Ok(Ok(())) => {}
            Ok(Err(oneshot::Canceled)) => {
                debug!(self.logger, "session closed while connecting");
                return Err(ZkError::InvalidState);
            }
            Err(_) => {
                warn!(self.logger, "timed out waiting for session";
                      "timeout_ms" => self.options.timeout.as_millis() as u64);
                self.shutdown(Some(epoch)).await;
                return Err(ZkError::OperationTimeout);
            }
        }

        let (session_id, connected) = {
            let mut state = self.state.lock().await;
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return Err(ZkError::InvalidState);
            }
            let handle = match state.handle {
                Some(ref handle) => handle.clone(),
                None => {
                    state.status = SessionStatus::Init;
                    return Err(ZkError::InvalidState);
                }
            };
            (handle.session_id(), handle.state().is_connected())
        };
        if !connected {
            self.shutdown(Some(epoch)).await;
            return Err(ZkError::InvalidState);
        }
        if session_id == 0 {
            self.shutdown(Some(epoch)).await;
            return Err(ZkError::InvalidClientId);
        }

        let credential = {
            let mut state = self.state.lock().await;
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return Err(ZkError::InvalidState);
            }
            state.id = format!("{:#x}", session_id);
            state.status = SessionStatus::Connected;
            state.credential.clone()
        };
        info!(self.logger, "session established"; "id" => format!("{:#x}", session_id));

        if !credential.is_empty() {
            if let Err(e) = self.add_auth("digest", credential.as_bytes()).await {
                warn!(self.logger, "failed to apply credential: {}", e);
            }
        }
        Ok(())
    }

    /// Drops the connection and fires [`ZkEvent::SessionClosed`] at every pending watch.
    pub async fn close(&self) {
        self.shutdown(None).await;
    }

    /// Closes the current connection, unless `epoch` is given and a newer one replaced it.
    async fn shutdown(&self, epoch: Option<u64>) {
        let handle = {
            let mut state = self.state.lock().await;
            if let Some(epoch) = epoch {
                if self.epoch.load(Ordering::SeqCst) != epoch {
                    return;
                }
            }
            self.epoch.fetch_add(1, Ordering::SeqCst);
            state.status = SessionStatus::Init;
            state.id.clear();
            state.connect_waiter = None;
            state.handle.take()
        };
        if handle.is_some() {
            info!(self.logger, "closing session");
        }
        drop(handle);
        let n = self
            .registry
            .drain_and_close_all(ZkEvent::SessionClosed)
            .await;
        if n > 0 {
            debug!(self.logger, "notified pending watches of close"; "watches" => n);
        }
    }

    async fn on_session_event(&self, epoch: u64, event: ZkEvent) {
        let expired = {
            let mut state = self.state.lock().await;
            if self.epoch.load(Ordering::SeqCst) != epoch {
                trace!(self.logger, "ignoring event from old connection"; "event" => %event);
                return;
            }
            if state.status == SessionStatus::Connecting {
                if let Some(waiter) = state.connect_waiter.take() {
                    let _ = waiter.send(());
                }
            }
            if event == ZkEvent::SessionExpired {
                state.status = SessionStatus::Expired;
                true
            } else {
                false
            }
        };

        if expired {
            error!(self.logger, "session expired");
        } else {
            debug!(self.logger, "session event"; "event" => %event);
        }
        if let Some(ref handler) = self.options.event_handler {
            handler(self.name.clone(), event);
        }
        if expired {
            tokio::spawn(reconnect(self.me.clone(), self.logger.clone()));
        }
    }

    /// Runs `op` against the current handle with the session lock held, retrying transient
    /// failures.
    async fn call<T, F, Fut>(&self, name: &'static str, path: &str, access: Access, op: F) -> ZkResult<T>
    where
        F: Fn(Arc<dyn Transport>) -> Fut,
        Fut: Future<Output = ZkResult<T>>,
    {
        let state = self.state.lock().await;
        if access == Access::Write && self.options.read_only {
            return Err(ZkError::ReadOnly);
        }
        let handle = state.handle.clone().ok_or(ZkError::InvalidState)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(handle.clone()).await {
                Err(e) if e.is_recoverable() && attempt <= self.options.max_retries => {
                    debug!(self.logger, "{} failed, retrying: {}", name, e;
                           "path" => path, "attempt" => attempt);
                    if !self.options.retry_backoff.is_zero() {
                        tokio::time::sleep(self.options.retry_backoff).await;
                    }
                }
                result => {
                    if let Err(ref e) = result {
                        trace!(self.logger, "{} failed: {}", name, e; "path" => path);
                    }
                    return result;
                }
            }
        }
    }

    /// Creates a node, returning the path the server assigned.
    pub async fn create(
        &self,
        path: &str,
        data: &[u8],
        acl: &[Acl],
        mode: CreateMode,
    ) -> ZkResult<String> {
        self.call("create", path, Access::Write, |h| async move {
            h.create(path, data, acl, mode).await
        })
        .await
    }

    pub async fn get(&self, path: &str) -> ZkResult<(Vec<u8>, Stat)> {
        self.call("get", path, Access::Read, |h| async move {
            h.get_data(path, false).await
        })
        .await
    }

    pub async fn set(&self, path: &str, data: &[u8], version: i32) -> ZkResult<Stat> {
        self.call("set", path, Access::Write, |h| async move {
            h.set_data(path, data, version).await
        })
        .await
    }

    pub async fn delete(&self, path: &str, version: i32) -> ZkResult<()> {
        self.call("delete", path, Access::Write, |h| async move {
            h.delete(path, version).await
        })
        .await
    }

    pub async fn exists(&self, path: &str) -> ZkResult<Stat> {
        self.call("exists", path, Access::Read, |h| async move {
            h.exists(path, false).await
        })
        .await
    }

    pub async fn get_children(&self, path: &str) -> ZkResult<Vec<String>> {
        self.call("get_children", path, Access::Read, |h| async move {
            h.get_children(path, false).await
        })
        .await
    }

    pub async fn get_acl(&self, path: &str) -> ZkResult<(Vec<Acl>, Stat)> {
        self.call("get_acl", path, Access::Read, |h| async move {
            h.get_acl(path).await
        })
        .await
    }

    pub async fn set_acl(&self, path: &str, acl: &[Acl], version: i32) -> ZkResult<Stat> {
        self.call("set_acl", path, Access::Write, |h| async move {
            h.set_acl(path, acl, version).await
        })
        .await
    }

    /// Reads a node and leaves a data watch on it.
    ///
    /// Callers arm watches through the [`WatcherRegistry`], which records the callback for the
    /// event this produces.
    pub async fn watcher_get(&self, path: &str) -> ZkResult<(Vec<u8>, Stat)> {
        self.call("watcher_get", path, Access::Write, |h| async move {
            h.get_data(path, true).await
        })
        .await
    }

    /// Checks a node and leaves an exists watch on it, whether or not it exists.
    pub async fn watcher_exists(&self, path: &str) -> ZkResult<Stat> {
        self.call("watcher_exists", path, Access::Write, |h| async move {
            h.exists(path, true).await
        })
        .await
    }

    /// Lists a node's children and leaves a children watch on it.
    pub async fn watcher_get_children(&self, path: &str) -> ZkResult<Vec<String>> {
        self.call("watcher_get_children", path, Access::Write, |h| async move {
            h.get_children(path, true).await
        })
        .await
    }

    /// Adds authentication information to the live connection.
    pub async fn add_auth(&self, scheme: &str, auth: &[u8]) -> ZkResult<()> {
        self.call("add_auth", "", Access::Read, |h| async move {
            h.add_auth(scheme, auth).await
        })
        .await
    }

    /// Authenticates as `credential` (a `user:password` pair) from now on, including after
    /// reconnects.
    pub async fn change_identity(&self, credential: &str) -> ZkResult<()> {
        self.state.lock().await.credential = credential.to_string();
        self.add_auth("digest", credential.as_bytes()).await
    }

    /// A handle on the node at `path`. The session must be connecting or connected.
    pub async fn open(self: &Arc<Self>, path: &str) -> ZkResult<Node> {
        match self.status().await {
            SessionStatus::Connecting | SessionStatus::Connected => {
                Ok(Node::new(self.clone(), path))
            }
            _ => Err(ZkError::Disconnected),
        }
    }

    /// The cluster this session talks to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The server-assigned session id, in `0x...` form. Empty unless connected.
    pub async fn id(&self) -> String {
        self.state.lock().await.id.clone()
    }

    pub async fn status(&self) -> SessionStatus {
        self.state.lock().await.status
    }

    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn watcher_registry(&self) -> &WatcherRegistry {
        &self.registry
    }

    pub(crate) fn logger(&self) -> &Logger {
        &self.logger
    }

    pub(crate) fn downgrade(&self) -> Weak<Session> {
        self.me.clone()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let n = self.registry.drain_owned(ZkEvent::SessionClosed);
        trace!(self.logger, "session dropped"; "pending_watches" => n);
    }
}

/// Replaces an expired session with a fresh one.
fn reconnect(session: Weak<Session>, logger: Logger) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        if let Some(session) = session.upgrade() {
            match session.connect().await {
                Ok(()) => info!(logger, "reconnected after expiry"),
                Err(e) => error!(logger, "failed to reconnect after expiry: {}", e),
            }
        }
    })
}

/// Feeds the events of one connection to its session until the connection goes away.
async fn dispatch(session: Weak<Session>, epoch: u64, mut events: EventReceiver, logger: Logger) {
    while let Some(e) = events.next().await {
        let session = match session.upgrade() {
            Some(session) => session,
            None => break,
        };
        if session.epoch.load(Ordering::SeqCst) != epoch {
            trace!(logger, "connection replaced; dropping its events");
            break;
        }
        trace!(logger, "got watcher event {:?}", e);
        match e.to_event() {
            Some(event) if event.is_session_event() => session.on_session_event(epoch, event).await,
            Some(event) => {
                let n = session.watcher_registry().dispatch(&e.path, event).await;
                trace!(logger, "dispatched node event"; "path" => &e.path, "event" => %event, "watches" => n);
            }
            None => {}
        }
    }
    trace!(logger, "event stream ended");
}
