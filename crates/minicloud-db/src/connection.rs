//! The control-plane connection: backend handle, machines and managers.

use std::sync::Arc;

use minicloud_core::{Error, Result};

use crate::backend::KvBackend;
use crate::fsm::MachineSet;
use crate::keys;
use crate::managers::{
    DiskManager, FlavorManager, ImageManager, ProjectManager, ServerManager,
};
use crate::model::Entity;
use crate::txn::Transaction;

/// A handle onto the coordination backend plus the installed machines.
///
/// Cheap to clone; managers borrow it per call, hooks receive it to
/// re-enter managers.
#[derive(Clone)]
pub struct Connection {
    backend: Arc<dyn KvBackend>,
    machines: Arc<MachineSet>,
}

impl Connection {
    /// Creates a connection from a backend and the per-type machines.
    #[must_use]
    pub fn new(backend: Arc<dyn KvBackend>, machines: Arc<MachineSet>) -> Self {
        Self { backend, machines }
    }

    /// Returns the backend handle.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    /// Returns the installed machines.
    #[must_use]
    pub fn machines(&self) -> &MachineSet {
        &self.machines
    }

    /// Starts a new transaction.
    #[must_use]
    pub fn new_transaction(&self) -> Transaction {
        Transaction::new(self.backend.clone())
    }

    /// The project manager.
    #[must_use]
    pub fn projects(&self) -> ProjectManager<'_> {
        ProjectManager::new(self)
    }

    /// The image manager.
    #[must_use]
    pub fn images(&self) -> ImageManager<'_> {
        ImageManager::new(self)
    }

    /// The disk manager.
    #[must_use]
    pub fn disks(&self) -> DiskManager<'_> {
        DiskManager::new(self)
    }

    /// The server manager.
    #[must_use]
    pub fn servers(&self) -> ServerManager<'_> {
        ServerManager::new(self)
    }

    /// The flavor manager.
    #[must_use]
    pub fn flavors(&self) -> FlavorManager<'_> {
        FlavorManager::new(self)
    }

    /// Loads one record, populating revisions and the `original` snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the key is absent, a
    /// serialization error when the stored JSON does not decode.
    pub(crate) async fn load<E: Entity>(&self, id: E::Id) -> Result<E> {
        let key = keys::data_key(E::KIND, &id.to_string());
        tracing::debug!(entity = %E::KIND, %id, %key, "loading entity");
        let raw = self.backend.read(&key).await?;
        if raw.is_absent() {
            tracing::debug!(entity = %E::KIND, %id, "entity not found");
            return Err(Error::not_found(E::KIND, id));
        }
        let mut entity: E = serde_json::from_slice(&raw.data)?;
        entity.header_mut().create_rev = raw.create_rev;
        entity.header_mut().modify_rev = raw.modify_rev;
        entity.snapshot_original();
        Ok(entity)
    }

    /// Lists all records of a kind in key (creation) order.
    ///
    /// # Errors
    ///
    /// Returns a backend or serialization error.
    pub(crate) async fn list<E: Entity>(&self) -> Result<Vec<E>> {
        let prefix = keys::data_prefix(E::KIND);
        let raws = self.backend.read_prefix(&prefix).await?;
        let mut entities = Vec::with_capacity(raws.len());
        for raw in raws {
            let mut entity: E = serde_json::from_slice(&raw.data)?;
            entity.header_mut().create_rev = raw.create_rev;
            entity.header_mut().modify_rev = raw.modify_rev;
            entity.snapshot_original();
            entities.push(entity);
        }
        Ok(entities)
    }
}
