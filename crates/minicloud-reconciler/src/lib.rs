//! # minicloud-reconciler
//!
//! The side-effect hooks attached to the entity state machines, and the
//! wiring that builds the hook-bearing [`MachineSet`] from the real (or
//! test) drivers.
//!
//! Hooks follow one shape: attempt the external effect, then move the
//! entity onward through a retried system update. Success leads to
//! `Ready`, failure to `Error`, teardown to the final delete. External
//! errors never escape a hook; they become state.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod disk;
pub mod image;
pub mod server;

use std::sync::Arc;

use minicloud_ceph::BlockStore;
use minicloud_core::State;
use minicloud_db::fsm::{
    disk_graph, flavor_graph, image_graph, project_graph, server_graph, MachineSet,
};
use minicloud_qemu::Hypervisor;

/// Builds the production machine set: every transition graph plus the
/// hooks bound to the given drivers.
#[must_use]
pub fn machines(store: Arc<dyn BlockStore>, hypervisor: Arc<dyn Hypervisor>) -> MachineSet {
    MachineSet {
        project: project_graph(),
        flavor: flavor_graph(),
        image: image_graph().hook(
            State::Deleting,
            Arc::new(image::ImageDeleting::new(store.clone())),
        ),
        disk: disk_graph()
            .hook(State::Created, Arc::new(disk::DiskCreated::new(store.clone())))
            .hook(State::Updated, Arc::new(disk::DiskUpdated::new(store.clone())))
            .hook(State::Deleting, Arc::new(disk::DiskDeleting::new(store))),
        server: server_graph()
            .hook(
                State::Created,
                Arc::new(server::ServerCreated::new(hypervisor.clone())),
            )
            .hook(
                State::Deleting,
                Arc::new(server::ServerDeleting::new(hypervisor)),
            ),
    }
}
