//! The flavor manager.

use std::sync::LazyLock;

use regex::Regex;

use minicloud_core::{EntityKind, Error, FlavorId, Initiator, Result, State};

use crate::connection::Connection;
use crate::keys;
use crate::model::{Entity, EntityHeader, Flavor};
use crate::txn::Transaction;

use super::{check_field_regex, MUST_BE_EMPTY, READ_ONLY};

static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-z0-9_.-]{3,}$").expect("static regex"));

const KIND: EntityKind = EntityKind::Flavor;

fn claim_name(tx: &mut Transaction, flavor: &Flavor) {
    tx.create_meta(
        keys::name_key(KIND, &flavor.name),
        flavor.header.id.to_string(),
    );
}

fn forfeit_name(tx: &mut Transaction, flavor: &Flavor) {
    let key = keys::name_key(KIND, &flavor.name);
    tx.check_meta(key.as_str(), flavor.header.id.to_string());
    tx.delete_meta(key);
}

/// CRUD for flavors.
pub struct FlavorManager<'c> {
    conn: &'c Connection,
}

impl<'c> FlavorManager<'c> {
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Produces a record with the default schema version and initial state.
    #[must_use]
    pub fn new_entity(&self) -> Flavor {
        Flavor {
            header: EntityHeader::new(State::Created),
            ..Flavor::default()
        }
    }

    /// Fetches a flavor by ID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when absent.
    pub async fn get(&self, id: FlavorId) -> Result<Flavor> {
        self.conn.load(id).await
    }

    /// Lists all flavors.
    ///
    /// # Errors
    ///
    /// Returns a backend or serialization error.
    pub async fn list(&self) -> Result<Vec<Flavor>> {
        self.conn.list().await
    }

    fn validate_fields(&self, flavor: &Flavor) -> Result<()> {
        check_field_regex(KIND, "Name", &flavor.name, &NAME_REGEX)?;
        if flavor.num_cpus <= 0 {
            return Err(Error::field(KIND, "NumCPUs", "Should be more than 0"));
        }
        if flavor.ram <= 0 {
            return Err(Error::field(KIND, "RAM", "Should be more than 0"));
        }
        Ok(())
    }

    /// Creates a flavor, allocating its ID and claiming its name.
    ///
    /// # Errors
    ///
    /// Returns a validation error or a conflict when the name is taken.
    pub async fn create(&self, flavor: &mut Flavor) -> Result<()> {
        self.conn
            .machines()
            .flavor
            .check_initial_state(flavor.state())?;
        self.validate_fields(flavor)?;
        if !flavor.server_ids.is_empty() {
            return Err(Error::field(KIND, "ServerIds", MUST_BE_EMPTY));
        }
        flavor.header.id = FlavorId::generate();

        let mut tx = self.conn.new_transaction();
        tx.create(flavor);
        claim_name(&mut tx, flavor);
        tx.commit().await
    }

    /// Updates a flavor, re-claiming uniqueness on rename.
    ///
    /// # Errors
    ///
    /// Returns a validation error or a conflict.
    pub async fn update(&self, flavor: &Flavor, initiator: Initiator) -> Result<()> {
        self.validate_fields(flavor)?;
        let original = flavor
            .original()
            .expect("update requires a record loaded from the backend");
        if flavor.header.id != original.header.id {
            return Err(Error::field(KIND, "Id", READ_ONLY));
        }
        // Sizing is fixed at creation.
        if flavor.num_cpus != original.num_cpus {
            return Err(Error::field(KIND, "NumCPUs", READ_ONLY));
        }
        if flavor.ram != original.ram {
            return Err(Error::field(KIND, "RAM", READ_ONLY));
        }
        self.conn.machines().flavor.check_transition(
            original.state(),
            flavor.state(),
            initiator,
        )?;
        if initiator != Initiator::System && flavor.server_ids != original.server_ids {
            return Err(Error::field(KIND, "ServerIds", READ_ONLY));
        }

        let mut tx = self.conn.new_transaction();
        tx.update(flavor);
        if original.name != flavor.name {
            forfeit_name(&mut tx, original);
            claim_name(&mut tx, flavor);
        }
        tx.commit().await
    }

    /// Requests deletion. Flavors carry no delete side effects, so this
    /// removes the record immediately.
    ///
    /// # Errors
    ///
    /// Returns a validation error while servers still use the flavor.
    pub async fn intent_delete(&self, id: FlavorId, initiator: Initiator) -> Result<()> {
        self.delete(id, initiator).await
    }

    /// Removes an unused flavor and forfeits its name claim.
    ///
    /// # Errors
    ///
    /// Returns a validation error while servers still use the flavor, or a
    /// conflict.
    pub async fn delete(&self, id: FlavorId, initiator: Initiator) -> Result<()> {
        let flavor = self.get(id).await?;
        if !flavor.server_ids.is_empty() {
            return Err(Error::field(KIND, "ServerIds", "Can't delete flavor in use"));
        }
        self.conn
            .machines()
            .flavor
            .check_transition(flavor.state(), State::Deleted, initiator)?;

        let mut tx = self.conn.new_transaction();
        forfeit_name(&mut tx, &flavor);
        tx.delete(&flavor);
        tx.commit().await
    }
}
