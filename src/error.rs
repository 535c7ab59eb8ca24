use failure::Fail;
use std::fmt;
use std::str::FromStr;

/// Convenience alias for results produced by this crate.
pub type ZkResult<T> = Result<T, ZkError>;

/// Every failure a session, node or lock operation can report.
///
/// The numeric codes match the ones used by the ZooKeeper C client, extended with a handful of
/// positive codes for conditions that this crate detects locally, without a round trip.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Fail)]
pub enum ZkError {
    /// The client id assigned by the server is not valid.
    #[fail(display = "client id is not valid")]
    InvalidClientId,
    /// The data stored on (or about to be written to) a node is not valid.
    #[fail(display = "node data is not valid")]
    InvalidData,
    /// A non-blocking lock attempt found the node locked by someone else.
    #[fail(display = "try to lock a locked node")]
    AlreadyLocked,
    /// The session is not connected.
    #[fail(display = "not connected to server")]
    Disconnected,
    /// The given path cannot be used.
    #[fail(display = "invalid path")]
    InvalidPath,
    /// The client was built read-only and the call would mutate or watch.
    #[fail(display = "client is readonly")]
    ReadOnly,

    /// Marks the start of the system error range; never returned by the server.
    #[fail(display = "system error")]
    SystemError,
    /// A runtime inconsistency was found.
    #[fail(display = "runtime inconsistency")]
    RuntimeInconsistency,
    /// A data inconsistency was found.
    #[fail(display = "data inconsistency")]
    DataInconsistency,
    /// Connection to the server has been lost.
    #[fail(display = "connection loss")]
    ConnectionLoss,
    /// Error while marshalling or unmarshalling data.
    #[fail(display = "marshalling error")]
    MarshallingError,
    /// Operation is unimplemented.
    #[fail(display = "unimplemented")]
    Unimplemented,
    /// Operation timeout.
    #[fail(display = "operation timeout")]
    OperationTimeout,
    /// Invalid arguments.
    #[fail(display = "bad arguments")]
    BadArguments,
    /// The session has no usable handle.
    #[fail(display = "invalid session state")]
    InvalidState,
    /// The cluster name could not be resolved to any endpoint.
    #[fail(display = "error occurs when dns lookup")]
    DnsFailure,

    /// Marks the start of the API error range; never returned by the server.
    #[fail(display = "api error")]
    ApiError,
    /// Node does not exist.
    #[fail(display = "no node")]
    NoNode,
    /// Not authenticated.
    #[fail(display = "not authenticated")]
    NoAuth,
    /// Version conflict.
    #[fail(display = "bad version")]
    BadVersion,
    /// Ephemeral nodes may not have children.
    #[fail(display = "no children for ephemerals")]
    NoChildrenForEphemerals,
    /// The node already exists.
    #[fail(display = "node exists")]
    NodeExists,
    /// The node has children.
    #[fail(display = "not empty")]
    NotEmpty,
    /// The session has been expired by the server.
    #[fail(display = "session expired")]
    SessionExpired,
    /// Invalid callback specified.
    #[fail(display = "invalid callback")]
    InvalidCallback,
    /// Invalid ACL specified.
    #[fail(display = "invalid acl")]
    InvalidAcl,
    /// Client authentication failed.
    #[fail(display = "authentication failed")]
    AuthFailed,
    /// The session is closing.
    #[fail(display = "zookeeper is closing")]
    Closing,
    /// Not an error: no server responses to process.
    #[fail(display = "(not error) no server responses to process")]
    Nothing,
    /// Session moved to another server, so the operation is ignored.
    #[fail(display = "session moved to another server, so operation is ignored")]
    SessionMoved,
    /// Quota is not enough.
    #[fail(display = "quota not enough")]
    NoQuota,
    /// The server is overloaded.
    #[fail(display = "server overload")]
    ServerOverload,
}

/// Coarse classification of a [`ZkError`], used to decide how callers should react.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorCategory {
    /// The link to the ensemble is unhealthy; usually worth retrying.
    Connectivity,
    /// A legitimate outcome of the requested operation the caller must branch on.
    Api,
    /// The session itself changed state (expired, moved, closing).
    SessionLifecycle,
    /// Detected by this crate before anything was sent.
    Local,
    /// Server-side or marshalling failures.
    System,
}

const ALL_ERRORS: [ZkError; 32] = [
    ZkError::InvalidClientId,
    ZkError::InvalidData,
    ZkError::AlreadyLocked,
    ZkError::Disconnected,
    ZkError::InvalidPath,
    ZkError::ReadOnly,
    ZkError::SystemError,
    ZkError::RuntimeInconsistency,
    ZkError::DataInconsistency,
    ZkError::ConnectionLoss,
    ZkError::MarshallingError,
    ZkError::Unimplemented,
    ZkError::OperationTimeout,
    ZkError::BadArguments,
    ZkError::InvalidState,
    ZkError::DnsFailure,
    ZkError::ApiError,
    ZkError::NoNode,
    ZkError::NoAuth,
    ZkError::BadVersion,
    ZkError::NoChildrenForEphemerals,
    ZkError::NodeExists,
    ZkError::NotEmpty,
    ZkError::SessionExpired,
    ZkError::InvalidCallback,
    ZkError::InvalidAcl,
    ZkError::AuthFailed,
    ZkError::Closing,
    ZkError::Nothing,
    ZkError::SessionMoved,
    ZkError::NoQuota,
    ZkError::ServerOverload,
];

impl ZkError {
    /// The numeric code of this error.
    pub fn code(self) -> i32 {
        match self {
            ZkError::InvalidClientId => 1,
            ZkError::InvalidData => 2,
            ZkError::AlreadyLocked => 3,
            ZkError::Disconnected => 4,
            ZkError::InvalidPath => 5,
            ZkError::ReadOnly => 6,
            ZkError::SystemError => -1,
            ZkError::RuntimeInconsistency => -2,
            ZkError::DataInconsistency => -3,
            ZkError::ConnectionLoss => -4,
            ZkError::MarshallingError => -5,
            ZkError::Unimplemented => -6,
            ZkError::OperationTimeout => -7,
            ZkError::BadArguments => -8,
            ZkError::InvalidState => -9,
            ZkError::DnsFailure => -10,
            ZkError::ApiError => -100,
            ZkError::NoNode => -101,
            ZkError::NoAuth => -102,
            ZkError::BadVersion => -103,
            ZkError::NoChildrenForEphemerals => -108,
            ZkError::NodeExists => -110,
            ZkError::NotEmpty => -111,
            ZkError::SessionExpired => -112,
            ZkError::InvalidCallback => -113,
            ZkError::InvalidAcl => -114,
            ZkError::AuthFailed => -115,
            ZkError::Closing => -116,
            ZkError::Nothing => -117,
            ZkError::SessionMoved => -118,
            ZkError::NoQuota => -119,
            ZkError::ServerOverload => -120,
        }
    }

    /// Looks up the error with the given numeric code. `0` (ok) and unknown codes yield `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        ALL_ERRORS.iter().copied().find(|e| e.code() == code)
    }

    /// The symbolic name of this error, e.g. `ZK_NONODE`.
    pub fn name(self) -> &'static str {
        match self {
            ZkError::InvalidClientId => "ZK_INVALIDCLIENTID",
            ZkError::InvalidData => "ZK_INVALIDDATA",
            ZkError::AlreadyLocked => "ZK_ALREADYLOCKED",
            ZkError::Disconnected => "ZK_DISCONNECTED",
            ZkError::InvalidPath => "ZK_INVALIDPATH",
            ZkError::ReadOnly => "ZK_READONLY",
            ZkError::SystemError => "ZK_SYSTEMERROR",
            ZkError::RuntimeInconsistency => "ZK_RUNTIMEINCONSISTENCY",
            ZkError::DataInconsistency => "ZK_DATAINCONSISTENCY",
            ZkError::ConnectionLoss => "ZK_CONNECTIONLOSS",
            ZkError::MarshallingError => "ZK_MARSHALLINGERROR",
            ZkError::Unimplemented => "ZK_UNIMPLEMENTED",
            ZkError::OperationTimeout => "ZK_OPERATIONTIMEOUT",
            ZkError::BadArguments => "ZK_BADARGUMENTS",
            ZkError::InvalidState => "ZK_INVALIDSTATE",
            ZkError::DnsFailure => "ZK_DNSFAILURE",
            ZkError::ApiError => "ZK_APIERROR",
            ZkError::NoNode => "ZK_NONODE",
            ZkError::NoAuth => "ZK_NOAUTH",
            ZkError::BadVersion => "ZK_BADVERSION",
            ZkError::NoChildrenForEphemerals => "ZK_NOCHILDRENFOREPHEMERALS",
            ZkError::NodeExists => "ZK_NODEEXISTS",
            ZkError::NotEmpty => "ZK_NOTEMPTY",
            ZkError::SessionExpired => "ZK_SESSIONEXPIRED",
            ZkError::InvalidCallback => "ZK_INVALIDCALLBACK",
            ZkError::InvalidAcl => "ZK_INVALIDACL",
            ZkError::AuthFailed => "ZK_AUTHFAILED",
            ZkError::Closing => "ZK_CLOSING",
            ZkError::Nothing => "ZK_NOTHING",
            ZkError::SessionMoved => "ZK_SESSIONMOVED",
            ZkError::NoQuota => "ZK_NOQUOTA",
            ZkError::ServerOverload => "ZK_SERVEROVERLOAD",
        }
    }

    /// Whether a session primitive should transparently retry after this error.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ZkError::OperationTimeout | ZkError::ConnectionLoss | ZkError::SessionMoved
        )
    }

    /// The coarse category this error belongs to.
    pub fn category(self) -> ErrorCategory {
        match self {
            ZkError::Disconnected
            | ZkError::ConnectionLoss
            | ZkError::DnsFailure
            | ZkError::OperationTimeout
            | ZkError::InvalidState => ErrorCategory::Connectivity,
            ZkError::SessionExpired | ZkError::SessionMoved | ZkError::Closing => {
                ErrorCategory::SessionLifecycle
            }
            ZkError::InvalidClientId
            | ZkError::InvalidPath
            | ZkError::InvalidData
            | ZkError::AlreadyLocked
            | ZkError::ReadOnly => ErrorCategory::Local,
            ZkError::SystemError
            | ZkError::RuntimeInconsistency
            | ZkError::DataInconsistency
            | ZkError::MarshallingError
            | ZkError::Unimplemented
            | ZkError::BadArguments => ErrorCategory::System,
            _ => ErrorCategory::Api,
        }
    }
}

/// Returned when parsing an unknown `ZK_*` name.
#[derive(Clone, Debug, PartialEq, Eq, Fail)]
#[fail(display = "{} is not an error code of zookeeper client", _0)]
pub struct UnknownErrorName(pub String);

impl FromStr for ZkError {
    type Err = UnknownErrorName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_ERRORS
            .iter()
            .copied()
            .find(|&e| e.name() == s)
            .ok_or_else(|| UnknownErrorName(s.to_string()))
    }
}

/// Session and node events delivered to watch callbacks and the session event handler.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ZkEvent {
    /// The session is connecting (or reconnecting) to a server.
    SessionConnecting,
    /// The session has been established (or re-established).
    SessionConnected,
    /// The server expired the session.
    SessionExpired,
    /// The session was closed locally; pending watches will never fire.
    SessionClosed,
    /// Authentication failed while opening the session.
    SessionAuthFailed,
    /// A node was created.
    NodeCreated,
    /// A node was deleted.
    NodeDeleted,
    /// A node's data changed.
    NodeChanged,
    /// The set of children of a node changed.
    ChildChanged,
}

impl ZkEvent {
    /// The numeric code of this event.
    pub fn code(self) -> i32 {
        match self {
            ZkEvent::SessionConnecting => 11,
            ZkEvent::SessionConnected => 12,
            ZkEvent::SessionExpired => 13,
            ZkEvent::SessionClosed => 14,
            ZkEvent::SessionAuthFailed => 15,
            ZkEvent::NodeCreated => 1,
            ZkEvent::NodeDeleted => 2,
            ZkEvent::NodeChanged => 3,
            ZkEvent::ChildChanged => 4,
        }
    }

    /// Whether this event describes the session rather than a node.
    pub fn is_session_event(self) -> bool {
        self.code() > 10
    }
}

impl fmt::Display for ZkEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match *self {
            ZkEvent::SessionConnecting => "session connecting event",
            ZkEvent::SessionConnected => "session connected event",
            ZkEvent::SessionExpired => "session expired event",
            ZkEvent::SessionClosed => "session closing event",
            ZkEvent::SessionAuthFailed => "session auth failed",
            ZkEvent::NodeCreated => "node created event",
            ZkEvent::NodeDeleted => "node deleted event",
            ZkEvent::NodeChanged => "node changed event",
            ZkEvent::ChildChanged => "node children changed event",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_lookup() {
        for e in ALL_ERRORS.iter() {
            assert_eq!(ZkError::from_code(e.code()), Some(*e));
        }
        assert_eq!(ZkError::from_code(0), None);
        assert_eq!(ZkError::from_code(-42), None);
    }

    #[test]
    fn names_parse() {
        for &e in ALL_ERRORS.iter() {
            assert_eq!(e.name().parse::<ZkError>(), Ok(e));
        }
        assert_eq!("ZK_NONODE".parse::<ZkError>(), Ok(ZkError::NoNode));
        assert_eq!(
            "ZK_SESSIONMOVED".parse::<ZkError>(),
            Ok(ZkError::SessionMoved)
        );
        assert_eq!(
            "ZK_BOGUS".parse::<ZkError>(),
            Err(UnknownErrorName("ZK_BOGUS".to_string()))
        );
    }

    #[test]
    fn only_transient_errors_are_recoverable() {
        let recoverable: Vec<_> = ALL_ERRORS
            .iter()
            .copied()
            .filter(|e| e.is_recoverable())
            .collect();
        assert_eq!(
            recoverable,
            vec![
                ZkError::ConnectionLoss,
                ZkError::OperationTimeout,
                ZkError::SessionMoved
            ]
        );
    }

    #[test]
    fn categories() {
        assert_eq!(ZkError::NoNode.category(), ErrorCategory::Api);
        assert_eq!(ZkError::NodeExists.category(), ErrorCategory::Api);
        assert_eq!(ZkError::ConnectionLoss.category(), ErrorCategory::Connectivity);
        assert_eq!(
            ZkError::SessionExpired.category(),
            ErrorCategory::SessionLifecycle
        );
        assert_eq!(ZkError::ReadOnly.category(), ErrorCategory::Local);
        assert_eq!(ZkError::MarshallingError.category(), ErrorCategory::System);
    }

    #[test]
    fn display_texts() {
        assert_eq!(ZkError::NoNode.to_string(), "no node");
        assert_eq!(ZkError::Closing.to_string(), "zookeeper is closing");
        assert_eq!(ZkEvent::ChildChanged.to_string(), "node children changed event");
        assert!(ZkEvent::SessionClosed.is_session_event());
        assert!(!ZkEvent::NodeDeleted.is_session_event());
    }
}
