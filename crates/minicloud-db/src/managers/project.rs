//! The project manager.

use std::sync::LazyLock;

use regex::Regex;

use minicloud_core::{EntityKind, Error, Initiator, ProjectId, Result, State};

use crate::connection::Connection;
use crate::keys;
use crate::model::{Entity, EntityHeader, Project};
use crate::txn::Transaction;

use super::{check_field_regex, MUST_BE_EMPTY, READ_ONLY};

static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-zA-Z0-9_.:-]{3,200}$").expect("static regex"));

const KIND: EntityKind = EntityKind::Project;

fn claim_name(tx: &mut Transaction, project: &Project) {
    tx.create_meta(
        keys::name_key(KIND, &project.name),
        project.header.id.to_string(),
    );
}

fn forfeit_name(tx: &mut Transaction, project: &Project) {
    let key = keys::name_key(KIND, &project.name);
    tx.check_meta(key.as_str(), project.header.id.to_string());
    tx.delete_meta(key);
}

/// CRUD for projects.
pub struct ProjectManager<'c> {
    conn: &'c Connection,
}

impl<'c> ProjectManager<'c> {
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Produces a record with the default schema version and initial state.
    #[must_use]
    pub fn new_entity(&self) -> Project {
        Project {
            header: EntityHeader::new(State::Created),
            ..Project::default()
        }
    }

    /// Fetches a project by ID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when absent.
    pub async fn get(&self, id: ProjectId) -> Result<Project> {
        self.conn.load(id).await
    }

    /// Lists all projects.
    ///
    /// # Errors
    ///
    /// Returns a backend or serialization error.
    pub async fn list(&self) -> Result<Vec<Project>> {
        self.conn.list().await
    }

    fn validate(&self, project: &Project) -> Result<()> {
        self.conn
            .machines()
            .project
            .check_initial_state(project.state())?;
        check_field_regex(KIND, "Name", &project.name, &NAME_REGEX)?;
        if !project.image_ids.is_empty() {
            return Err(Error::field(KIND, "ImageIds", MUST_BE_EMPTY));
        }
        if !project.disk_ids.is_empty() {
            return Err(Error::field(KIND, "DiskIds", MUST_BE_EMPTY));
        }
        if !project.server_ids.is_empty() {
            return Err(Error::field(KIND, "ServerIds", MUST_BE_EMPTY));
        }
        Ok(())
    }

    fn validate_update(&self, project: &Project, initiator: Initiator) -> Result<()> {
        check_field_regex(KIND, "Name", &project.name, &NAME_REGEX)?;
        let original = project
            .original()
            .expect("update requires a record loaded from the backend");
        if project.header.id != original.header.id {
            return Err(Error::field(KIND, "Id", READ_ONLY));
        }
        self.conn.machines().project.check_transition(
            original.state(),
            project.state(),
            initiator,
        )?;
        if initiator != Initiator::System {
            if project.image_ids != original.image_ids {
                return Err(Error::field(KIND, "ImageIds", READ_ONLY));
            }
            if project.disk_ids != original.disk_ids {
                return Err(Error::field(KIND, "DiskIds", READ_ONLY));
            }
            if project.server_ids != original.server_ids {
                return Err(Error::field(KIND, "ServerIds", READ_ONLY));
            }
        }
        Ok(())
    }

    /// Creates a project, allocating its ID and claiming its name.
    ///
    /// # Errors
    ///
    /// Returns a validation error or a conflict when the name is taken.
    pub async fn create(&self, project: &mut Project) -> Result<()> {
        self.validate(project)?;
        project.header.id = ProjectId::generate();

        let mut tx = self.conn.new_transaction();
        tx.create(project);
        claim_name(&mut tx, project);
        tx.commit().await
    }

    /// Updates a project, re-claiming uniqueness on rename.
    ///
    /// # Errors
    ///
    /// Returns a validation error or a conflict.
    pub async fn update(&self, project: &Project, initiator: Initiator) -> Result<()> {
        self.validate_update(project, initiator)?;
        let original = project
            .original()
            .expect("update requires a record loaded from the backend");

        let mut tx = self.conn.new_transaction();
        tx.update(project);
        if original.name != project.name {
            forfeit_name(&mut tx, original);
            claim_name(&mut tx, project);
        }
        tx.commit().await
    }

    /// Requests deletion. Projects carry no delete side effects, so this
    /// removes the record immediately.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the project still has dependents.
    pub async fn intent_delete(&self, id: ProjectId, initiator: Initiator) -> Result<()> {
        self.delete(id, initiator).await
    }

    /// Removes an empty project and forfeits its name claim.
    ///
    /// # Errors
    ///
    /// Returns a validation error when dependents remain, or a conflict.
    pub async fn delete(&self, id: ProjectId, initiator: Initiator) -> Result<()> {
        let project = self.get(id).await?;
        if !project.image_ids.is_empty() {
            return Err(Error::field(KIND, "ImageIds", "Can't delete non-empty project"));
        }
        if !project.disk_ids.is_empty() {
            return Err(Error::field(KIND, "DiskIds", "Can't delete non-empty project"));
        }
        if !project.server_ids.is_empty() {
            return Err(Error::field(KIND, "ServerIds", "Can't delete non-empty project"));
        }
        self.conn
            .machines()
            .project
            .check_transition(project.state(), State::Deleted, initiator)?;

        let mut tx = self.conn.new_transaction();
        forfeit_name(&mut tx, &project);
        tx.delete(&project);
        tx.commit().await
    }
}
