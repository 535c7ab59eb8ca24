use crate::ZkEvent;

/// Represents a change on the ZooKeeper that a watcher is able to respond to.
///
/// Transports report both session state transitions (with `event_type` set to
/// [`WatchedEventType::None`]) and node changes through this one type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchedEvent {
    /// The trigger that caused the watch to hit.
    pub event_type: WatchedEventType,
    /// The current state of ZooKeeper (and the client's connection to it).
    pub keeper_state: KeeperState,
    /// The path of the znode that was involved.
    // This will be empty for session-related triggers.
    pub path: String,
}

impl WatchedEvent {
    /// A session state transition.
    pub fn session(keeper_state: KeeperState) -> Self {
        WatchedEvent {
            event_type: WatchedEventType::None,
            keeper_state,
            path: String::new(),
        }
    }

    /// A change to the node at `path`, observed while connected.
    pub fn node(event_type: WatchedEventType, path: impl Into<String>) -> Self {
        WatchedEvent {
            event_type,
            keeper_state: KeeperState::SyncConnected,
            path: path.into(),
        }
    }

    /// Translates this event into the [`ZkEvent`] delivered to callbacks, if it maps to one.
    pub fn to_event(&self) -> Option<ZkEvent> {
        match self.event_type {
            WatchedEventType::None => match self.keeper_state {
                KeeperState::Disconnected => Some(ZkEvent::SessionConnecting),
                KeeperState::SyncConnected | KeeperState::ConnectedReadOnly => {
                    Some(ZkEvent::SessionConnected)
                }
                KeeperState::AuthFailed => Some(ZkEvent::SessionAuthFailed),
                KeeperState::Expired => Some(ZkEvent::SessionExpired),
                KeeperState::SaslAuthenticated => None,
            },
            WatchedEventType::NodeCreated => Some(ZkEvent::NodeCreated),
            WatchedEventType::NodeDeleted => Some(ZkEvent::NodeDeleted),
            WatchedEventType::NodeDataChanged => Some(ZkEvent::NodeChanged),
            WatchedEventType::NodeChildrenChanged => Some(ZkEvent::ChildChanged),
        }
    }
}

/// Enumeration of states the client may be at a Watcher Event. It represents the state of the
/// server at the time the event was generated.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeeperState {
    /// The client is not connected to any server in the ensemble; it keeps trying.
    Disconnected = 0,
    /// The client is connected to a server in the ensemble.
    SyncConnected = 3,
    /// Authentication has failed -- connection requires a new session.
    AuthFailed = 4,
    /// The client is connected to a read-only server, that is the server which is not currently
    /// connected to the majority.
    ConnectedReadOnly = 5,
    /// The client is SASL-authenticated.
    SaslAuthenticated = 6,
    /// The serving cluster has expired this session. The session is no longer valid and a new
    /// one has to be established.
    Expired = -112,
}

impl KeeperState {
    /// Whether requests can be served in this state.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            KeeperState::SyncConnected
                | KeeperState::ConnectedReadOnly
                | KeeperState::SaslAuthenticated
        )
    }
}

/// Enumeration of types of events that may occur on the znode.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchedEventType {
    /// Nothing known has occurred on the znode. This value is issued as part of a `WatchedEvent`
    /// when the `KeeperState` changes.
    None = -1,
    /// Issued when a znode at a given path is created.
    NodeCreated = 1,
    /// Issued when a znode at a given path is deleted.
    NodeDeleted = 2,
    /// Issued when the data of a watched znode are altered. This event value is issued whenever a
    /// *set* operation occurs without an actual contents check, so there is no guarantee the data
    /// actually changed.
    NodeDataChanged = 3,
    /// Issued when the children of a watched znode are created or deleted. This event is not issued
    /// when the data within children is altered.
    NodeChildrenChanged = 4,
}
