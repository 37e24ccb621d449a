//! Server reconciliation hooks.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use minicloud_core::{retry, Initiator, ServerId, State};
use minicloud_db::model::{Record, Server};
use minicloud_db::{Connection, Hook};
use minicloud_qemu::{DiskCache, Hypervisor, VmDisk, VmSpec};

async fn set_server_state(
    shutdown: &CancellationToken,
    conn: &Connection,
    id: ServerId,
    state: State,
) {
    let result = retry(shutdown, || async move {
        let mut server = conn.servers().get(id).await?;
        conn.machines()
            .server
            .change_state(&mut server, state, Initiator::System)?;
        conn.servers().update(&server, Initiator::System).await
    })
    .await;
    if let Err(e) = result {
        tracing::error!(server_id = %id, state = %state, error = %e, "failed to change server state");
    }
}

async fn build_spec(conn: &Connection, server: &Server) -> minicloud_core::Result<VmSpec> {
    let flavor = conn.flavors().get(server.flavor_id).await?;
    let mut disks = Vec::with_capacity(server.disk_ids.len());
    for disk_id in &server.disk_ids {
        let disk = conn.disks().get(*disk_id).await?;
        disks.push(VmDisk {
            pool: disk.pool,
            disk: disk_id.to_string(),
            cache: DiskCache::WriteBack,
        });
    }
    Ok(VmSpec {
        id: server.header.id,
        num_cpus: flavor.num_cpus,
        ram_mb: flavor.ram,
        vnc_port: 0,
        disks,
    })
}

/// `Created` hook: start the hypervisor process and resume the machine.
pub struct ServerCreated {
    hypervisor: Arc<dyn Hypervisor>,
}

impl ServerCreated {
    /// Creates the hook.
    #[must_use]
    pub fn new(hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self { hypervisor }
    }
}

#[async_trait]
impl Hook for ServerCreated {
    async fn run(&self, shutdown: CancellationToken, conn: &Connection, record: Record) {
        let Record::Server(server) = record else { return };
        let id = server.header.id;
        let next = match build_spec(conn, &server).await {
            Ok(spec) => match self.hypervisor.start(spec).await {
                Ok(()) => State::Ready,
                Err(e) => {
                    tracing::error!(server_id = %id, error = %e, "failed to start virtual machine");
                    State::Error
                }
            },
            Err(e) => {
                tracing::error!(server_id = %id, error = %e, "failed to assemble machine spec");
                State::Error
            }
        };
        set_server_state(&shutdown, conn, id, next).await;
    }
}

/// `Deleting` hook: tear the hypervisor process down, then the record.
pub struct ServerDeleting {
    hypervisor: Arc<dyn Hypervisor>,
}

impl ServerDeleting {
    /// Creates the hook.
    #[must_use]
    pub fn new(hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self { hypervisor }
    }
}

#[async_trait]
impl Hook for ServerDeleting {
    async fn run(&self, shutdown: CancellationToken, conn: &Connection, record: Record) {
        let Record::Server(server) = record else { return };
        let id = server.header.id;
        if let Err(e) = self.hypervisor.stop(id).await {
            // The record still goes away; a lingering process is an
            // operator problem, a stuck record is a user problem.
            tracing::error!(server_id = %id, error = %e, "failed to stop virtual machine");
        }
        let result = retry(&shutdown, || async move {
            conn.servers().delete(id, Initiator::System).await
        })
        .await;
        if let Err(e) = result {
            tracing::error!(server_id = %id, error = %e, "failed to delete server record");
        }
    }
}
