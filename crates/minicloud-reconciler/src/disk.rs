//! Disk reconciliation hooks.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use minicloud_ceph::BlockStore;
use minicloud_core::{retry, DiskId, Initiator, State};
use minicloud_db::model::Record;
use minicloud_db::{Connection, Hook};

/// Moves a disk to `state` through a retried system update.
async fn set_disk_state(
    shutdown: &CancellationToken,
    conn: &Connection,
    id: DiskId,
    state: State,
) {
    let result = retry(shutdown, || async move {
        let mut disk = conn.disks().get(id).await?;
        conn.machines()
            .disk
            .change_state(&mut disk, state, Initiator::System)?;
        conn.disks().update(&disk, Initiator::System).await
    })
    .await;
    if let Err(e) = result {
        tracing::error!(disk_id = %id, state = %state, error = %e, "failed to change disk state");
    }
}

/// `Created` hook: materialize the disk in the storage cluster.
pub struct DiskCreated {
    store: Arc<dyn BlockStore>,
}

impl DiskCreated {
    /// Creates the hook.
    #[must_use]
    pub fn new(store: Arc<dyn BlockStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Hook for DiskCreated {
    async fn run(&self, shutdown: CancellationToken, conn: &Connection, record: Record) {
        let Record::Disk(disk) = record else { return };
        let name = disk.header.id.to_string();
        let result = match disk.image_id {
            Some(image_id) => {
                self.store
                    .clone_from_image(&disk.pool, &name, &image_id.to_string(), disk.size)
                    .await
            }
            None => self.store.create_disk(&disk.pool, &name, disk.size).await,
        };
        let next = match result {
            Ok(()) => State::Ready,
            Err(e) => {
                tracing::warn!(disk_id = %disk.header.id, error = %e, "disk materialization failed");
                State::Error
            }
        };
        set_disk_state(&shutdown, conn, disk.header.id, next).await;
    }
}

/// `Updated` hook: apply the requested resize.
pub struct DiskUpdated {
    store: Arc<dyn BlockStore>,
}

impl DiskUpdated {
    /// Creates the hook.
    #[must_use]
    pub fn new(store: Arc<dyn BlockStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Hook for DiskUpdated {
    async fn run(&self, shutdown: CancellationToken, conn: &Connection, record: Record) {
        let Record::Disk(disk) = record else { return };
        let name = disk.header.id.to_string();
        let next = match self.store.resize_disk(&disk.pool, &name, disk.size).await {
            Ok(()) => State::Ready,
            Err(e) => {
                tracing::warn!(disk_id = %disk.header.id, error = %e, "disk resize failed");
                State::Error
            }
        };
        set_disk_state(&shutdown, conn, disk.header.id, next).await;
    }
}

/// `Deleting` hook: remove the disk bytes, then the record.
pub struct DiskDeleting {
    store: Arc<dyn BlockStore>,
}

impl DiskDeleting {
    /// Creates the hook.
    #[must_use]
    pub fn new(store: Arc<dyn BlockStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Hook for DiskDeleting {
    async fn run(&self, shutdown: CancellationToken, conn: &Connection, record: Record) {
        let Record::Disk(disk) = record else { return };
        let id = disk.header.id;
        let name = id.to_string();
        if let Err(e) = self.store.delete_disk(&disk.pool, &name).await {
            tracing::warn!(disk_id = %id, error = %e, "disk removal failed");
            set_disk_state(&shutdown, conn, id, State::Error).await;
            return;
        }
        let result = retry(&shutdown, || async move {
            conn.disks().delete(id, Initiator::System).await
        })
        .await;
        if let Err(e) = result {
            tracing::error!(disk_id = %id, error = %e, "failed to delete disk record");
        }
    }
}
