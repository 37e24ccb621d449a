//! The disk manager.

use minicloud_core::{DiskId, EntityKind, Error, Initiator, Result, State};

use crate::connection::Connection;
use crate::model::{Disk, Entity, EntityHeader, Image};

use super::READ_ONLY;

const KIND: EntityKind = EntityKind::Disk;

/// CRUD for disks.
pub struct DiskManager<'c> {
    conn: &'c Connection,
}

impl<'c> DiskManager<'c> {
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Produces a record with the default schema version and initial state.
    #[must_use]
    pub fn new_entity(&self) -> Disk {
        Disk {
            header: EntityHeader::new(State::Created),
            ..Disk::default()
        }
    }

    /// Fetches a disk by ID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when absent.
    pub async fn get(&self, id: DiskId) -> Result<Disk> {
        self.conn.load(id).await
    }

    /// Lists all disks.
    ///
    /// # Errors
    ///
    /// Returns a backend or serialization error.
    pub async fn list(&self) -> Result<Vec<Disk>> {
        self.conn.list().await
    }

    fn validate(&self, disk: &Disk) -> Result<()> {
        self.conn.machines().disk.check_initial_state(disk.state())?;
        if disk.pool.is_empty() {
            return Err(Error::field(KIND, "Pool", "Should not be empty"));
        }
        if disk.size == 0 {
            return Err(Error::field(KIND, "Size", "Should be more than 0"));
        }
        if disk.server_id.is_some() {
            return Err(Error::field(KIND, "ServerId", "Should be empty"));
        }
        Ok(())
    }

    fn validate_update(&self, disk: &Disk, initiator: Initiator) -> Result<()> {
        let original = disk
            .original()
            .expect("update requires a record loaded from the backend");
        if disk.header.id != original.header.id {
            return Err(Error::field(KIND, "Id", READ_ONLY));
        }
        if disk.project_id != original.project_id {
            return Err(Error::field(KIND, "ProjectId", READ_ONLY));
        }
        if disk.image_id != original.image_id {
            return Err(Error::field(KIND, "ImageId", READ_ONLY));
        }
        if initiator != Initiator::System && disk.server_id != original.server_id {
            return Err(Error::field(KIND, "ServerId", READ_ONLY));
        }
        self.conn.machines().disk.check_transition(
            original.state(),
            disk.state(),
            initiator,
        )?;
        Ok(())
    }

    /// Creates a disk, appending back-references on the project and the
    /// source image (which must be `Ready`).
    ///
    /// # Errors
    ///
    /// Returns a validation error, [`Error::NotFound`] for a missing
    /// reference, [`Error::InvalidState`] for an image that is not ready,
    /// or a conflict.
    pub async fn create(&self, disk: &mut Disk) -> Result<()> {
        self.validate(disk)?;
        let mut project = self.conn.projects().get(disk.project_id).await?;
        let mut image: Option<Image> = None;
        if let Some(image_id) = disk.image_id {
            let found = self.conn.images().get(image_id).await?;
            if found.state() != State::Ready {
                tracing::debug!(image_id = %image_id, state = %found.state(), "image in invalid state");
                return Err(Error::InvalidState {
                    state: found.state(),
                });
            }
            image = Some(found);
        }

        disk.header.id = DiskId::generate();
        project.disk_ids.push(disk.header.id);
        if let Some(image) = image.as_mut() {
            image.disk_ids.push(disk.header.id);
        }

        let mut tx = self.conn.new_transaction();
        tx.create(disk);
        tx.update(&project);
        if let Some(image) = &image {
            tx.update(image);
        }
        self.conn.machines().disk.notify(&mut tx, disk);
        tx.commit().await
    }

    /// Updates a disk, emitting the notification delta for any state
    /// change (e.g. a user resize through `Updated`).
    ///
    /// # Errors
    ///
    /// Returns a validation error or a conflict.
    pub async fn update(&self, disk: &Disk, initiator: Initiator) -> Result<()> {
        self.validate_update(disk, initiator)?;

        let mut tx = self.conn.new_transaction();
        tx.update(disk);
        self.conn.machines().disk.notify(&mut tx, disk);
        tx.commit().await
    }

    /// Marks a disk `Deleting`; the attached hook removes the bytes from
    /// the storage cluster and performs the final delete.
    ///
    /// # Errors
    ///
    /// Returns a validation error while the disk is attached to a server.
    pub async fn intent_delete(&self, id: DiskId, initiator: Initiator) -> Result<()> {
        let mut disk = self.get(id).await?;
        if disk.server_id.is_some() {
            return Err(Error::field(KIND, "ServerId", "Disk is attached to a server"));
        }
        self.conn
            .machines()
            .disk
            .change_state(&mut disk, State::Deleting, initiator)?;

        let mut tx = self.conn.new_transaction();
        tx.update(&disk);
        self.conn.machines().disk.notify(&mut tx, &disk);
        tx.commit().await
    }

    /// Final removal: drops the record, the back-references and the
    /// pending notification atomically.
    ///
    /// # Errors
    ///
    /// Returns a transition error unless the disk is `Deleting`, or a
    /// conflict.
    pub async fn delete(&self, id: DiskId, initiator: Initiator) -> Result<()> {
        let disk = self.get(id).await?;
        self.conn.machines().disk.check_transition(
            disk.state(),
            State::Deleted,
            initiator,
        )?;
        let mut project = self.conn.projects().get(disk.project_id).await?;
        project.disk_ids.retain(|id| *id != disk.header.id);
        let mut image: Option<Image> = None;
        if let Some(image_id) = disk.image_id {
            let mut found = self.conn.images().get(image_id).await?;
            found.disk_ids.retain(|id| *id != disk.header.id);
            image = Some(found);
        }

        let mut tx = self.conn.new_transaction();
        tx.delete(&disk);
        tx.update(&project);
        if let Some(image) = &image {
            tx.update(image);
        }
        self.conn.machines().disk.delete_notification(&mut tx, &disk);
        tx.commit().await
    }
}
