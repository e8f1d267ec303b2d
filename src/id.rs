use std::fmt;

/// Identifies a participating file in the sync network.
///
/// The coordinator is always 1, regular peers are assigned identities >= 2
/// by the coordinator. The reserved value 0 tags history entries that were
/// produced locally; it never identifies a participant on the wire.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FileIdent(u64);

impl FileIdent {
    /// The coordinator's file identity.
    pub const COORDINATOR: FileIdent = FileIdent(1);

    /// Origin tag for locally produced history entries.
    pub const LOCAL: FileIdent = FileIdent(0);

    /// Creates a file identity from its raw value.
    pub fn new(ident: u64) -> Self {
        Self(ident)
    }

    /// Returns the raw value.
    pub fn get(self) -> u64 {
        self.0
    }

    /// Returns true for the local-origin tag.
    pub fn is_local(self) -> bool {
        self.0 == 0
    }

    /// Returns true for the coordinator.
    pub fn is_coordinator(self) -> bool {
        self.0 == 1
    }
}

impl fmt::Debug for FileIdent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "file:{}", self.0)
    }
}

impl fmt::Display for FileIdent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A per-peer monotonic timestamp.
///
/// Timestamps order concurrent mutations between peers and serve no other
/// purpose; they are never assumed comparable to wall-clock time on another
/// peer.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp from its raw value.
    pub fn new(t: u64) -> Self {
        Self(t)
    }

    /// Returns the raw value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "t:{}", self.0)
    }
}

/// A per-peer version number. Versions are contiguous from 1.
pub type Version = u64;

/// A version paired with the opaque salt the coordinator issued for it.
///
/// The salt detects cross-file-identity confusion after a coordinator-side
/// reset; it is propagated verbatim and never ordered.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct SaltedVersion {
    /// The version number.
    pub version: Version,
    /// The salt issued for this version.
    pub salt: u64,
}

impl SaltedVersion {
    /// Pairs a version with a salt.
    pub fn new(version: Version, salt: u64) -> Self {
        Self { version, salt }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_ident_roles() {
        assert!(FileIdent::LOCAL.is_local());
        assert!(FileIdent::COORDINATOR.is_coordinator());
        assert!(!FileIdent::new(7).is_local());
        assert_eq!(format!("{:?}", FileIdent::new(7)), "file:7");
    }

    #[test]
    fn timestamps_order() {
        assert!(Timestamp::new(2) > Timestamp::new(1));
        assert_eq!(Timestamp::new(3).get(), 3);
    }

    #[test]
    fn salted_versions_propagate_but_never_order() {
        let a = SaltedVersion::new(4, 99);
        assert_eq!(a.version, 4);
        assert_eq!(a.salt, 99);
        assert_ne!(a, SaltedVersion::new(4, 100));
    }
}
