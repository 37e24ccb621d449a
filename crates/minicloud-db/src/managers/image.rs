//! The image manager.

use std::sync::LazyLock;

use regex::Regex;

use minicloud_core::{EntityKind, Error, ImageId, Initiator, Result, State};

use crate::connection::Connection;
use crate::keys;
use crate::model::{Entity, EntityHeader, Image};
use crate::txn::Transaction;

use super::{check_field_regex, MUST_BE_EMPTY, READ_ONLY};

static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-zA-Z0-9_.:-]{3,200}$").expect("static regex"));

const KIND: EntityKind = EntityKind::Image;

fn claim_name(tx: &mut Transaction, image: &Image) {
    tx.create_meta(
        keys::project_name_key(KIND, image.project_id, &image.name),
        image.header.id.to_string(),
    );
}

fn forfeit_name(tx: &mut Transaction, image: &Image) {
    let key = keys::project_name_key(KIND, image.project_id, &image.name);
    tx.check_meta(key.as_str(), image.header.id.to_string());
    tx.delete_meta(key);
}

/// CRUD for images.
pub struct ImageManager<'c> {
    conn: &'c Connection,
}

impl<'c> ImageManager<'c> {
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Produces a record with the default schema version and initial state.
    #[must_use]
    pub fn new_entity(&self) -> Image {
        Image {
            header: EntityHeader::new(State::Created),
            ..Image::default()
        }
    }

    /// Fetches an image by ID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when absent.
    pub async fn get(&self, id: ImageId) -> Result<Image> {
        self.conn.load(id).await
    }

    /// Lists all images.
    ///
    /// # Errors
    ///
    /// Returns a backend or serialization error.
    pub async fn list(&self) -> Result<Vec<Image>> {
        self.conn.list().await
    }

    fn validate(&self, image: &Image) -> Result<()> {
        self.conn
            .machines()
            .image
            .check_initial_state(image.state())?;
        check_field_regex(KIND, "Name", &image.name, &NAME_REGEX)?;
        if !image.checksum.is_empty() {
            return Err(Error::field(KIND, "Checksum", READ_ONLY));
        }
        if !image.disk_ids.is_empty() {
            return Err(Error::field(KIND, "DiskIds", MUST_BE_EMPTY));
        }
        Ok(())
    }

    fn validate_update(&self, image: &Image, initiator: Initiator) -> Result<()> {
        check_field_regex(KIND, "Name", &image.name, &NAME_REGEX)?;
        let original = image
            .original()
            .expect("update requires a record loaded from the backend");
        if image.header.id != original.header.id {
            return Err(Error::field(KIND, "Id", READ_ONLY));
        }
        if image.project_id != original.project_id {
            return Err(Error::field(KIND, "ProjectId", READ_ONLY));
        }
        self.conn.machines().image.check_transition(
            original.state(),
            image.state(),
            initiator,
        )?;
        if initiator != Initiator::System {
            if image.checksum != original.checksum {
                return Err(Error::field(KIND, "Checksum", READ_ONLY));
            }
            if image.disk_ids != original.disk_ids {
                return Err(Error::field(KIND, "DiskIds", READ_ONLY));
            }
        }
        Ok(())
    }

    /// Creates an image inside a project, claiming its per-project name
    /// and appending the back-reference.
    ///
    /// # Errors
    ///
    /// Returns a validation error, [`Error::NotFound`] for the project, or
    /// a conflict.
    pub async fn create(&self, image: &mut Image) -> Result<()> {
        self.validate(image)?;
        let mut project = self.conn.projects().get(image.project_id).await?;

        image.header.id = ImageId::generate();
        project.image_ids.push(image.header.id);

        let mut tx = self.conn.new_transaction();
        tx.create(image);
        tx.update(&project);
        claim_name(&mut tx, image);
        self.conn.machines().image.notify(&mut tx, image);
        tx.commit().await
    }

    /// Updates an image, re-claiming uniqueness on rename.
    ///
    /// # Errors
    ///
    /// Returns a validation error or a conflict.
    pub async fn update(&self, image: &Image, initiator: Initiator) -> Result<()> {
        self.validate_update(image, initiator)?;
        let original = image
            .original()
            .expect("update requires a record loaded from the backend");

        let mut tx = self.conn.new_transaction();
        if original.name != image.name {
            forfeit_name(&mut tx, original);
            claim_name(&mut tx, image);
        }
        tx.update(image);
        self.conn.machines().image.notify(&mut tx, image);
        tx.commit().await
    }

    /// Marks an image `Deleting`; the attached hook removes the bytes from
    /// the storage cluster and performs the final delete.
    ///
    /// # Errors
    ///
    /// Returns a validation error while disks still reference the image.
    pub async fn intent_delete(&self, id: ImageId, initiator: Initiator) -> Result<()> {
        let mut image = self.get(id).await?;
        if !image.disk_ids.is_empty() {
            return Err(Error::field(
                KIND,
                "DiskIds",
                "Can't delete image referenced by disk",
            ));
        }
        self.conn
            .machines()
            .image
            .change_state(&mut image, State::Deleting, initiator)?;

        let mut tx = self.conn.new_transaction();
        tx.update(&image);
        self.conn.machines().image.notify(&mut tx, &image);
        tx.commit().await
    }

    /// Final removal: drops the record, the back-reference, the name claim
    /// and the pending notification atomically.
    ///
    /// # Errors
    ///
    /// Returns a transition error unless the image is `Deleting`, or a
    /// conflict.
    pub async fn delete(&self, id: ImageId, initiator: Initiator) -> Result<()> {
        let image = self.get(id).await?;
        if !image.disk_ids.is_empty() {
            return Err(Error::field(
                KIND,
                "DiskIds",
                "Can't delete image referenced by disk",
            ));
        }
        self.conn.machines().image.check_transition(
            image.state(),
            State::Deleted,
            initiator,
        )?;
        let mut project = self.conn.projects().get(image.project_id).await?;
        project.image_ids.retain(|id| *id != image.header.id);

        let mut tx = self.conn.new_transaction();
        forfeit_name(&mut tx, &image);
        tx.delete(&image);
        tx.update(&project);
        self.conn.machines().image.delete_notification(&mut tx, &image);
        tx.commit().await
    }
}
