mod acl;
pub use self::acl::*;

mod watch;
pub use self::watch::*;

/// Statistics about a znode, similar to the UNIX `stat` structure.
///
/// Every change to the ensemble is stamped with a *zxid*; the `*zxid` fields below expose the
/// total order of the changes that touched this node. Version counters grow by one with every
/// change to the node's data, children or ACL respectively.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct Stat {
    /// The transaction ID that created the znode.
    pub czxid: i64,
    /// The last transaction that modified the znode.
    pub mzxid: i64,
    /// Milliseconds since epoch when the znode was created.
    pub ctime: i64,
    /// Milliseconds since epoch when the znode was last modified.
    pub mtime: i64,
    /// The number of changes to the data of the znode.
    pub version: i32,
    /// The number of changes to the children of the znode.
    pub cversion: i32,
    /// The number of changes to the ACL of the znode.
    pub aversion: i32,
    /// The session ID of the owner of this znode, if it is an ephemeral entry.
    pub ephemeral_owner: i64,
    /// The length of the data field of the znode.
    pub data_length: i32,
    /// The number of children this znode has.
    pub num_children: i32,
    /// The transaction ID that last modified the children of the znode.
    pub pzxid: i64,
}

/// Determines how a znode is created.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CreateMode {
    /// The znode outlives the session that created it.
    #[default]
    Persistent = 0,
    /// The znode is deleted when the creating session ends.
    Ephemeral = 1,
    /// The server appends a monotonically increasing, zero padded, 10 digit counter to the
    /// requested name.
    PersistentSequential = 2,
    /// Both ephemeral and sequential.
    EphemeralSequential = 3,
    //
    // 21
    // 00
    // ^---- is it sequential?
    //  ^--- is it ephemeral?
}

impl CreateMode {
    /// Whether nodes created with this mode disappear with their session.
    pub fn is_ephemeral(self) -> bool {
        (self as i32) & 1 != 0
    }

    /// Whether the server appends a sequence number to the node name.
    pub fn is_sequential(self) -> bool {
        (self as i32) & 2 != 0
    }
}
