//! The server manager.
//!
//! Server creation is the widest transaction in the system: the server
//! record, back-references on project and flavor, an ownership and state
//! flip on every attached disk, the name claim and the `Created`
//! notification all commit atomically or not at all.

use std::sync::LazyLock;

use regex::Regex;

use minicloud_core::{EntityKind, Error, Initiator, Result, ServerId, State};

use crate::connection::Connection;
use crate::model::{Disk, Entity, EntityHeader, Server};
use crate::txn::Transaction;
use crate::keys;

use super::{check_field_regex, READ_ONLY};

static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("static regex"));

const KIND: EntityKind = EntityKind::Server;

fn claim_name(tx: &mut Transaction, server: &Server) {
    tx.create_meta(
        keys::project_name_key(KIND, server.project_id, &server.name),
        server.header.id.to_string(),
    );
}

fn forfeit_name(tx: &mut Transaction, server: &Server) {
    let key = keys::project_name_key(KIND, server.project_id, &server.name);
    tx.check_meta(key.as_str(), server.header.id.to_string());
    tx.delete_meta(key);
}

fn validate_name(name: &str) -> Result<()> {
    check_field_regex(KIND, "Name", name, &NAME_REGEX)?;
    if !name.bytes().any(|b| b.is_ascii_lowercase()) {
        return Err(Error::field(
            KIND,
            "Name",
            "name should have at least one letter",
        ));
    }
    Ok(())
}

/// CRUD for servers.
pub struct ServerManager<'c> {
    conn: &'c Connection,
}

impl<'c> ServerManager<'c> {
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Produces a record with the default schema version and initial state.
    #[must_use]
    pub fn new_entity(&self) -> Server {
        Server {
            header: EntityHeader::new(State::Created),
            ..Server::default()
        }
    }

    /// Fetches a server by ID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when absent.
    pub async fn get(&self, id: ServerId) -> Result<Server> {
        self.conn.load(id).await
    }

    /// Lists all servers.
    ///
    /// # Errors
    ///
    /// Returns a backend or serialization error.
    pub async fn list(&self) -> Result<Vec<Server>> {
        self.conn.list().await
    }

    /// Creates a server: claims the name, appends back-references on the
    /// project and the flavor, and attaches every referenced disk
    /// (`Ready` → `InUse`, ownership set), all in one transaction.
    ///
    /// # Errors
    ///
    /// Returns a validation error, [`Error::NotFound`] for a missing
    /// reference, a transition error for a disk that is not `Ready`, or a
    /// conflict.
    pub async fn create(&self, server: &mut Server) -> Result<()> {
        self.conn
            .machines()
            .server
            .check_initial_state(server.state())?;
        validate_name(&server.name)?;

        let mut project = self.conn.projects().get(server.project_id).await?;
        let mut flavor = self.conn.flavors().get(server.flavor_id).await?;
        let mut disks: Vec<Disk> = Vec::with_capacity(server.disk_ids.len());
        for disk_id in &server.disk_ids {
            disks.push(self.conn.disks().get(*disk_id).await?);
        }

        server.header.id = ServerId::generate();
        project.server_ids.push(server.header.id);
        flavor.server_ids.push(server.header.id);
        for disk in &mut disks {
            if disk.server_id.is_some() {
                return Err(Error::field(
                    EntityKind::Disk,
                    "ServerId",
                    "Disk is attached to a server",
                ));
            }
            self.conn
                .machines()
                .disk
                .change_state(disk, State::InUse, Initiator::System)?;
            disk.server_id = Some(server.header.id);
        }

        let mut tx = self.conn.new_transaction();
        tx.create(server);
        tx.update(&project);
        tx.update(&flavor);
        for disk in &disks {
            tx.update(disk);
            self.conn.machines().disk.notify(&mut tx, disk);
        }
        claim_name(&mut tx, server);
        self.conn.machines().server.notify(&mut tx, server);
        tx.commit().await
    }

    /// Updates a server, re-claiming uniqueness on rename.
    ///
    /// # Errors
    ///
    /// Returns a validation error or a conflict.
    pub async fn update(&self, server: &Server, initiator: Initiator) -> Result<()> {
        validate_name(&server.name)?;
        let original = server
            .original()
            .expect("update requires a record loaded from the backend");
        if server.header.id != original.header.id {
            return Err(Error::field(KIND, "Id", READ_ONLY));
        }
        if server.project_id != original.project_id {
            return Err(Error::field(KIND, "ProjectId", READ_ONLY));
        }
        if server.flavor_id != original.flavor_id {
            return Err(Error::field(KIND, "FlavorId", READ_ONLY));
        }
        if server.disk_ids != original.disk_ids {
            return Err(Error::field(KIND, "DiskIds", READ_ONLY));
        }
        self.conn.machines().server.check_transition(
            original.state(),
            server.state(),
            initiator,
        )?;

        let mut tx = self.conn.new_transaction();
        if original.name != server.name {
            forfeit_name(&mut tx, original);
            claim_name(&mut tx, server);
        }
        tx.update(server);
        self.conn.machines().server.notify(&mut tx, server);
        tx.commit().await
    }

    /// Marks a server `Deleting`; the attached hook tears the hypervisor
    /// process down and performs the final delete.
    ///
    /// # Errors
    ///
    /// Returns a transition error or a conflict.
    pub async fn intent_delete(&self, id: ServerId, initiator: Initiator) -> Result<()> {
        let mut server = self.get(id).await?;
        self.conn
            .machines()
            .server
            .change_state(&mut server, State::Deleting, initiator)?;

        let mut tx = self.conn.new_transaction();
        tx.update(&server);
        self.conn.machines().server.notify(&mut tx, &server);
        tx.commit().await
    }

    /// Final removal: atomically reverses everything create did.
    /// Back-references are dropped, disks detach back to `Ready`, the
    /// name claim is forfeited and the pending notification cleared.
    ///
    /// # Errors
    ///
    /// Returns a transition error unless the server is `Deleting`, or a
    /// conflict.
    pub async fn delete(&self, id: ServerId, initiator: Initiator) -> Result<()> {
        let server = self.get(id).await?;
        self.conn.machines().server.check_transition(
            server.state(),
            State::Deleted,
            initiator,
        )?;

        let mut project = self.conn.projects().get(server.project_id).await?;
        let mut flavor = self.conn.flavors().get(server.flavor_id).await?;
        let mut disks: Vec<Disk> = Vec::with_capacity(server.disk_ids.len());
        for disk_id in &server.disk_ids {
            disks.push(self.conn.disks().get(*disk_id).await?);
        }

        project.server_ids.retain(|sid| *sid != server.header.id);
        flavor.server_ids.retain(|sid| *sid != server.header.id);
        for disk in &mut disks {
            self.conn
                .machines()
                .disk
                .change_state(disk, State::Ready, Initiator::System)?;
            disk.server_id = None;
        }

        let mut tx = self.conn.new_transaction();
        tx.delete(&server);
        tx.update(&project);
        tx.update(&flavor);
        for disk in &disks {
            tx.update(disk);
            self.conn.machines().disk.notify(&mut tx, disk);
        }
        forfeit_name(&mut tx, &server);
        self.conn.machines().server.delete_notification(&mut tx, &server);
        tx.commit().await
    }
}
