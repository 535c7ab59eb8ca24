use once_cell::sync::Lazy;
use std::fmt;
use std::ops;

/// Describes the ability of a user to perform a certain action.
///
/// Permissions combine with `|` and can be tested with [`Permission::can`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Permission(u32);

impl Permission {
    /// No permissions are set (server could have been configured without ACL support).
    pub const NONE: Permission = Permission(0b00000);
    /// You can access the data of a node and can list its children.
    pub const READ: Permission = Permission(0b00001);
    /// You can set the data of a node.
    pub const WRITE: Permission = Permission(0b00010);
    /// You can create a child node.
    pub const CREATE: Permission = Permission(0b00100);
    /// You can delete a child node (but not necessarily this one).
    pub const DELETE: Permission = Permission(0b01000);
    /// You can alter permissions on this node.
    pub const ADMIN: Permission = Permission(0b10000);
    /// You can do anything.
    pub const ALL: Permission = Permission(0b11111);

    /// Builds a permission set from its raw bit representation, dropping unknown bits.
    pub fn from_raw(bits: u32) -> Permission {
        Permission(bits & Self::ALL.0)
    }

    /// The raw bit representation.
    pub fn code(self) -> u32 {
        self.0
    }

    /// Whether every permission in `other` is also granted by `self`.
    pub fn can(self, other: Permission) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl ops::BitOr for Permission {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Permission(self.0 | rhs.0)
    }
}

impl ops::BitAnd for Permission {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Permission(self.0 & rhs.0)
    }
}

impl fmt::Display for Permission {
    /// Renders as five flags in `acdwr` order, with `-` for missing ones.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let flags = [
            (Permission::ADMIN, 'a'),
            (Permission::CREATE, 'c'),
            (Permission::DELETE, 'd'),
            (Permission::WRITE, 'w'),
            (Permission::READ, 'r'),
        ];
        for (perm, c) in flags.iter() {
            if self.can(*perm) {
                write!(f, "{}", c)?;
            } else {
                write!(f, "-")?;
            }
        }
        Ok(())
    }
}

/// An access control list entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Acl {
    /// The permissions associated with this ACL.
    pub perms: Permission,
    /// The authentication scheme this list is used for. The most common scheme is `"auth"`,
    /// which allows any authenticated user to do anything (see `creator_all`).
    pub scheme: String,
    /// The ID of the user under the `scheme`.
    pub id: String,
}

impl Acl {
    /// This ACL gives the creators authentication id's all permissions.
    pub fn creator_all() -> &'static [Acl] {
        &ACL_CREATOR_ALL[..]
    }

    /// This is a completely open ACL.
    pub fn open_unsafe() -> &'static [Acl] {
        &ACL_OPEN_UNSAFE[..]
    }

    /// This ACL gives the world the ability to read.
    pub fn read_unsafe() -> &'static [Acl] {
        &ACL_READ_UNSAFE[..]
    }
}

static ACL_CREATOR_ALL: Lazy<[Acl; 1]> = Lazy::new(|| {
    [Acl {
        perms: Permission::ALL,
        scheme: "auth".to_string(),
        id: "".to_string(),
    }]
});
static ACL_OPEN_UNSAFE: Lazy<[Acl; 1]> = Lazy::new(|| {
    [Acl {
        perms: Permission::ALL,
        scheme: "world".to_string(),
        id: "anyone".to_string(),
    }]
});
static ACL_READ_UNSAFE: Lazy<[Acl; 1]> = Lazy::new(|| {
    [Acl {
        perms: Permission::READ,
        scheme: "world".to_string(),
        id: "anyone".to_string(),
    }]
});

/// An editable list of ACL entries, keyed by `(scheme, id)`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AclList {
    entries: Vec<Acl>,
}

impl AclList {
    /// Creates an empty list.
    pub fn new() -> Self {
        AclList::default()
    }

    /// Adds an entry, replacing the permissions of an existing `(scheme, id)` entry.
    pub fn add_entry(&mut self, scheme: &str, id: &str, perms: Permission) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.scheme == scheme && e.id == id)
        {
            Some(entry) => entry.perms = perms,
            None => self.entries.push(Acl {
                perms,
                scheme: scheme.to_string(),
                id: id.to_string(),
            }),
        }
    }

    /// Removes the `(scheme, id)` entry if present.
    pub fn remove_entry(&mut self, scheme: &str, id: &str) {
        self.entries.retain(|e| !(e.scheme == scheme && e.id == id));
    }

    /// The permissions granted to `(scheme, id)`, if it has an entry.
    pub fn permission(&self, scheme: &str, id: &str) -> Option<Permission> {
        self.entries
            .iter()
            .find(|e| e.scheme == scheme && e.id == id)
            .map(|e| e.perms)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Acl> {
        self.entries.iter()
    }

    pub fn as_slice(&self) -> &[Acl] {
        &self.entries
    }
}

impl From<Vec<Acl>> for AclList {
    fn from(entries: Vec<Acl>) -> Self {
        let mut list = AclList::new();
        for e in entries {
            list.add_entry(&e.scheme, &e.id, e.perms);
        }
        list
    }
}

impl<'a> IntoIterator for &'a AclList {
    type Item = &'a Acl;
    type IntoIter = std::slice::Iter<'a, Acl>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
