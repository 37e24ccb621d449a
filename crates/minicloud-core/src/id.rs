//! Strongly-typed identifiers for MiniCloud entities.
//!
//! All identifiers are ULIDs:
//! - **Strongly typed**: a `DiskId` cannot be passed where a `ServerId` is
//!   expected
//! - **Lexicographically sortable**: the timestamp prefix makes backend keys
//!   sort by creation time
//! - **Globally unique**: no coordination required for generation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// The fixed set of entity kinds managed by the control plane.
///
/// The lowercase name of a kind is used in backend key paths
/// (`/minicloud/db/data/<kind>/<id>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// Grouping of images, disks and servers.
    Project,
    /// Immutable disk template hosted in the storage cluster.
    Image,
    /// Block device hosted in the storage cluster.
    Disk,
    /// Virtual server backed by a hypervisor process.
    Server,
    /// Sizing template for servers.
    Flavor,
}

impl EntityKind {
    /// Returns the lowercase name used in backend keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Image => "image",
            Self::Disk => "disk",
            Self::Server => "server",
            Self::Flavor => "flavor",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "project" => Ok(Self::Project),
            "image" => Ok(Self::Image),
            "disk" => Ok(Self::Disk),
            "server" => Ok(Self::Server),
            "flavor" => Ok(Self::Flavor),
            other => Err(Error::InvalidId {
                message: format!("unknown entity kind '{other}'"),
            }),
        }
    }
}

/// A unique identifier for a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(Ulid);

impl Default for ProjectId {
    fn default() -> Self {
        Self(Ulid::nil())
    }
}

impl ProjectId {
    /// Generates a new unique project ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a project ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s).map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid project ID '{s}': {e}"),
        })
    }
}

/// A unique identifier for an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(Ulid);

impl Default for ImageId {
    fn default() -> Self {
        Self(Ulid::nil())
    }
}

impl ImageId {
    /// Generates a new unique image ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates an image ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ImageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s).map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid image ID '{s}': {e}"),
        })
    }
}

/// A unique identifier for a disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiskId(Ulid);

impl Default for DiskId {
    fn default() -> Self {
        Self(Ulid::nil())
    }
}

impl DiskId {
    /// Generates a new unique disk ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a disk ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for DiskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DiskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s).map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid disk ID '{s}': {e}"),
        })
    }
}

/// A unique identifier for a virtual server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(Ulid);

impl Default for ServerId {
    fn default() -> Self {
        Self(Ulid::nil())
    }
}

impl ServerId {
    /// Generates a new unique server ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a server ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Formats the ID as a lowercase hex UUID for the hypervisor.
    ///
    /// The 16 ULID bytes map directly onto the 16 UUID bytes.
    #[must_use]
    pub fn to_uuid_string(&self) -> String {
        let b = self.0.to_bytes();
        format!(
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15],
        )
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ServerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s).map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid server ID '{s}': {e}"),
        })
    }
}

/// A unique identifier for a flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlavorId(Ulid);

impl Default for FlavorId {
    fn default() -> Self {
        Self(Ulid::nil())
    }
}

impl FlavorId {
    /// Generates a new unique flavor ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a flavor ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for FlavorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FlavorId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s).map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid flavor ID '{s}': {e}"),
        })
    }
}

/// The identity of one entry of an entity into a hook-bearing state.
///
/// A fresh notification ID is minted every time an entity enters a state
/// with a hook attached; the dispatcher uses it to tell a live notification
/// apart from a superseded one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(Ulid);

impl NotificationId {
    /// Generates a new unique notification ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NotificationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s).map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid notification ID '{s}': {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_id_roundtrip() {
        let id = ProjectId::generate();
        let parsed: ProjectId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(DiskId::generate(), DiskId::generate());
    }

    #[test]
    fn invalid_id_returns_error() {
        let result: Result<ServerId> = "not-a-valid-ulid".parse();
        assert!(result.is_err());
    }

    #[test]
    fn entity_kind_roundtrip() {
        for kind in [
            EntityKind::Project,
            EntityKind::Image,
            EntityKind::Disk,
            EntityKind::Server,
            EntityKind::Flavor,
        ] {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("volume".parse::<EntityKind>().is_err());
    }

    #[test]
    fn server_uuid_has_canonical_shape() {
        let uuid = ServerId::generate().to_uuid_string();
        assert_eq!(uuid.len(), 36);
        assert_eq!(uuid.matches('-').count(), 4);
        assert_eq!(uuid, uuid.to_lowercase());
    }
}
