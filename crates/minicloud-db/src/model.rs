//! Entity records and the common header.
//!
//! Every record embeds an [`EntityHeader`]: the typed ID, the schema
//! version, the lifecycle state, the backend revisions of the last load,
//! and the `original` snapshot. Revisions and the snapshot are in-memory
//! only and never serialized; record JSON uses PascalCase field names.
//!
//! A loaded record always carries `original`: an independent deep copy of
//! the record as it was read from the backend. Managers diff the live
//! record against it to reject changes to read-only fields and to
//! recompute uniqueness claims on rename.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use minicloud_core::{
    DiskId, EntityKind, FlavorId, ImageId, ProjectId, ServerId, State,
};

use crate::keys;

/// The common header embedded in every entity record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct EntityHeader<I> {
    /// The entity's unique, lexicographically-sortable identifier.
    #[serde(default)]
    pub id: I,
    /// Schema version recorded at creation.
    #[serde(default)]
    pub schema_version: i64,
    /// Current lifecycle state.
    #[serde(default)]
    pub state: State,
    /// Backend revision at which the record was created. Not serialized.
    #[serde(skip)]
    pub create_rev: i64,
    /// Backend revision of the last modification; the optimistic-concurrency
    /// guard for updates and deletes. Not serialized.
    #[serde(skip)]
    pub modify_rev: i64,
}

impl<I: Default> EntityHeader<I> {
    /// Creates a header for a brand-new record in the given state.
    #[must_use]
    pub fn new(state: State) -> Self {
        Self {
            schema_version: 1,
            state,
            ..Self::default()
        }
    }
}

/// A typed entity record.
///
/// Implemented by the five record types; gives the transaction builder and
/// the managers uniform access to the header, the data key and the
/// `original` snapshot.
pub trait Entity:
    Clone + Serialize + DeserializeOwned + Send + Sync + fmt::Debug + 'static
{
    /// The record's typed identifier.
    type Id: Copy + Eq + fmt::Display + Send + Sync;

    /// The entity kind, fixed per record type.
    const KIND: EntityKind;

    /// Returns the common header.
    fn header(&self) -> &EntityHeader<Self::Id>;

    /// Returns the common header mutably.
    fn header_mut(&mut self) -> &mut EntityHeader<Self::Id>;

    /// Returns the snapshot taken at load time, if any.
    fn original(&self) -> Option<&Self>;

    /// Replaces the snapshot.
    fn set_original(&mut self, snapshot: Option<Box<Self>>);

    /// Returns the record's backend data key.
    fn data_key(&self) -> String {
        keys::data_key(Self::KIND, &self.header().id.to_string())
    }

    /// Returns the current lifecycle state.
    fn state(&self) -> State {
        self.header().state
    }

    /// Returns the state the record was loaded in, `None` before first
    /// persist.
    fn original_state(&self) -> Option<State> {
        self.original().map(|o| o.header().state)
    }

    /// Stores a deep copy of the current fields as the new snapshot.
    fn snapshot_original(&mut self) {
        let mut copy = self.clone();
        copy.set_original(None);
        self.set_original(Some(Box::new(copy)));
    }
}

/// Grouping of images, disks and servers.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Project {
    /// Common header.
    #[serde(flatten)]
    pub header: EntityHeader<ProjectId>,
    /// Globally-unique project name.
    #[serde(default)]
    pub name: String,
    /// Back-references to images in this project.
    #[serde(default)]
    pub image_ids: Vec<ImageId>,
    /// Back-references to disks in this project.
    #[serde(default)]
    pub disk_ids: Vec<DiskId>,
    /// Back-references to servers in this project.
    #[serde(default)]
    pub server_ids: Vec<ServerId>,
    #[serde(skip)]
    pub(crate) original: Option<Box<Project>>,
}

impl Entity for Project {
    type Id = ProjectId;
    const KIND: EntityKind = EntityKind::Project;

    fn header(&self) -> &EntityHeader<ProjectId> {
        &self.header
    }
    fn header_mut(&mut self) -> &mut EntityHeader<ProjectId> {
        &mut self.header
    }
    fn original(&self) -> Option<&Self> {
        self.original.as_deref()
    }
    fn set_original(&mut self, snapshot: Option<Box<Self>>) {
        self.original = snapshot;
    }
}

/// Immutable disk template hosted in the storage cluster's image pool.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Image {
    /// Common header.
    #[serde(flatten)]
    pub header: EntityHeader<ImageId>,
    /// Image name, unique within the owning project.
    #[serde(default)]
    pub name: String,
    /// Lowercase hex MD5 of the uploaded content; set by the upload flow.
    #[serde(default)]
    pub checksum: String,
    /// The owning project.
    #[serde(default)]
    pub project_id: ProjectId,
    /// Back-references to disks cloned from this image.
    #[serde(default)]
    pub disk_ids: Vec<DiskId>,
    #[serde(skip)]
    pub(crate) original: Option<Box<Image>>,
}

impl Entity for Image {
    type Id = ImageId;
    const KIND: EntityKind = EntityKind::Image;

    fn header(&self) -> &EntityHeader<ImageId> {
        &self.header
    }
    fn header_mut(&mut self) -> &mut EntityHeader<ImageId> {
        &mut self.header
    }
    fn original(&self) -> Option<&Self> {
        self.original.as_deref()
    }
    fn set_original(&mut self, snapshot: Option<Box<Self>>) {
        self.original = snapshot;
    }
}

/// Block device hosted in the storage cluster.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Disk {
    /// Common header.
    #[serde(flatten)]
    pub header: EntityHeader<DiskId>,
    /// The owning project.
    #[serde(default)]
    pub project_id: ProjectId,
    /// Image the disk was cloned from, if any.
    #[serde(default)]
    pub image_id: Option<ImageId>,
    /// Free-form description.
    #[serde(default)]
    pub desc: String,
    /// Storage-cluster pool hosting the disk bytes.
    #[serde(default)]
    pub pool: String,
    /// Disk size in bytes.
    #[serde(default)]
    pub size: u64,
    /// The server the disk is attached to, if any. Set by the system.
    #[serde(default)]
    pub server_id: Option<ServerId>,
    #[serde(skip)]
    pub(crate) original: Option<Box<Disk>>,
}

impl Entity for Disk {
    type Id = DiskId;
    const KIND: EntityKind = EntityKind::Disk;

    fn header(&self) -> &EntityHeader<DiskId> {
        &self.header
    }
    fn header_mut(&mut self) -> &mut EntityHeader<DiskId> {
        &mut self.header
    }
    fn original(&self) -> Option<&Self> {
        self.original.as_deref()
    }
    fn set_original(&mut self, snapshot: Option<Box<Self>>) {
        self.original = snapshot;
    }
}

/// Virtual server backed by a hypervisor process.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Server {
    /// Common header.
    #[serde(flatten)]
    pub header: EntityHeader<ServerId>,
    /// The owning project.
    #[serde(default)]
    pub project_id: ProjectId,
    /// The sizing flavor.
    #[serde(default)]
    pub flavor_id: FlavorId,
    /// Disks attached to the server, in device order.
    #[serde(default)]
    pub disk_ids: Vec<DiskId>,
    /// DNS-label-shaped name, unique within the owning project.
    #[serde(default)]
    pub name: String,
    #[serde(skip)]
    pub(crate) original: Option<Box<Server>>,
}

impl Entity for Server {
    type Id = ServerId;
    const KIND: EntityKind = EntityKind::Server;

    fn header(&self) -> &EntityHeader<ServerId> {
        &self.header
    }
    fn header_mut(&mut self) -> &mut EntityHeader<ServerId> {
        &mut self.header
    }
    fn original(&self) -> Option<&Self> {
        self.original.as_deref()
    }
    fn set_original(&mut self, snapshot: Option<Box<Self>>) {
        self.original = snapshot;
    }
}

/// Sizing template for servers.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Flavor {
    /// Common header.
    #[serde(flatten)]
    pub header: EntityHeader<FlavorId>,
    /// Globally-unique flavor name.
    #[serde(default)]
    pub name: String,
    /// Number of virtual CPUs.
    #[serde(default, rename = "NumCPUs")]
    pub num_cpus: i64,
    /// Memory in megabytes.
    #[serde(default, rename = "RAM")]
    pub ram: i64,
    /// Back-references to servers using this flavor.
    #[serde(default)]
    pub server_ids: Vec<ServerId>,
    #[serde(skip)]
    pub(crate) original: Option<Box<Flavor>>,
}

impl Entity for Flavor {
    type Id = FlavorId;
    const KIND: EntityKind = EntityKind::Flavor;

    fn header(&self) -> &EntityHeader<FlavorId> {
        &self.header
    }
    fn header_mut(&mut self) -> &mut EntityHeader<FlavorId> {
        &mut self.header
    }
    fn original(&self) -> Option<&Self> {
        self.original.as_deref()
    }
    fn set_original(&mut self, snapshot: Option<Box<Self>>) {
        self.original = snapshot;
    }
}

/// A loaded record of any kind, as handed to state-machine hooks.
#[derive(Debug, Clone)]
pub enum Record {
    /// A project record.
    Project(Project),
    /// An image record.
    Image(Image),
    /// A disk record.
    Disk(Disk),
    /// A server record.
    Server(Server),
    /// A flavor record.
    Flavor(Flavor),
}

impl Record {
    /// Returns the record's entity kind.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Project(_) => EntityKind::Project,
            Self::Image(_) => EntityKind::Image,
            Self::Disk(_) => EntityKind::Disk,
            Self::Server(_) => EntityKind::Server,
            Self::Flavor(_) => EntityKind::Flavor,
        }
    }

    /// Returns the record's current state.
    #[must_use]
    pub fn state(&self) -> State {
        match self {
            Self::Project(e) => e.state(),
            Self::Image(e) => e.state(),
            Self::Disk(e) => e.state(),
            Self::Server(e) => e.state(),
            Self::Flavor(e) => e.state(),
        }
    }

    /// Returns the record's ID rendered as a string.
    #[must_use]
    pub fn id_string(&self) -> String {
        match self {
            Self::Project(e) => e.header.id.to_string(),
            Self::Image(e) => e.header.id.to_string(),
            Self::Disk(e) => e.header.id.to_string(),
            Self::Server(e) => e.header.id.to_string(),
            Self::Flavor(e) => e.header.id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revisions_and_original_are_not_serialized() {
        let mut project = Project {
            header: EntityHeader::new(State::Created),
            name: "alpha".into(),
            ..Project::default()
        };
        project.header.id = ProjectId::generate();
        project.header.create_rev = 10;
        project.header.modify_rev = 20;
        project.snapshot_original();

        let json = serde_json::to_value(&project).unwrap();
        let object = json.as_object().unwrap();
        assert!(object.contains_key("Id"));
        assert!(object.contains_key("SchemaVersion"));
        assert!(object.contains_key("State"));
        assert!(object.contains_key("Name"));
        assert!(!object.contains_key("CreateRev"));
        assert!(!object.contains_key("ModifyRev"));
        assert!(!object.contains_key("Original"));
    }

    #[test]
    fn create_body_deserializes_with_defaults() {
        let project: Project = serde_json::from_str(r#"{"Name":"alpha"}"#).unwrap();
        assert_eq!(project.name, "alpha");
        assert_eq!(project.state(), State::Created);
        assert!(project.image_ids.is_empty());
    }

    #[test]
    fn flavor_uses_original_field_spelling() {
        let flavor = Flavor {
            header: EntityHeader::new(State::Created),
            name: "small".into(),
            num_cpus: 2,
            ram: 2048,
            ..Flavor::default()
        };
        let json = serde_json::to_value(&flavor).unwrap();
        assert_eq!(json["NumCPUs"], 2);
        assert_eq!(json["RAM"], 2048);
    }

    #[test]
    fn snapshot_is_a_deep_copy() {
        let mut project = Project {
            header: EntityHeader::new(State::Created),
            name: "alpha".into(),
            ..Project::default()
        };
        project.snapshot_original();
        project.name = "beta".into();
        project.image_ids.push(ImageId::generate());

        let original = project.original().unwrap();
        assert_eq!(original.name, "alpha");
        assert!(original.image_ids.is_empty());
        assert_eq!(project.original_state(), Some(State::Created));
    }
}
