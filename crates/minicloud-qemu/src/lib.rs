//! # minicloud-qemu
//!
//! Hypervisor supervision for the MiniCloud control plane: QEMU command
//! construction, subprocess lifecycle and the QMP monitor protocol.
//!
//! The [`Hypervisor`] trait fronts the driver so reconciliation hooks are
//! testable without a hypervisor binary; [`QemuHypervisor`] is the real
//! implementation, holding one supervised [`vm::VirtualMachine`] per
//! running server.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod command;
pub mod monitor;
pub mod vm;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use minicloud_core::config::{self, ConfigOption};
use minicloud_core::{Result, ServerId};

pub use monitor::Monitor;
pub use vm::{DiskCache, VirtualMachine, VmDisk, VmSpec};

/// Budget for connecting to a just-started VM's monitor socket.
pub static OPT_MONITOR_CONNECT_TIMEOUT: LazyLock<&'static ConfigOption<Duration>> =
    LazyLock::new(|| config::duration_opt("qemu_monitor_connect_timeout", Duration::from_secs(5)));

/// The hypervisor operations the reconciliation hooks depend on.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Starts a virtual machine and resumes its VCPUs.
    ///
    /// Idempotent: starting an already-running server is a success.
    async fn start(&self, spec: VmSpec) -> Result<()>;

    /// Stops a virtual machine: graceful quit through the monitor, kill on
    /// failure. A server with no running machine is a success.
    async fn stop(&self, id: ServerId) -> Result<()>;
}

/// The QEMU-backed hypervisor.
///
/// Owns the per-server registry of supervised machines. Each VM gets a
/// working directory under the configured root holding its monitor socket
/// and process logs.
pub struct QemuHypervisor {
    root: PathBuf,
    machines: Mutex<HashMap<ServerId, VirtualMachine>>,
}

impl QemuHypervisor {
    /// Creates a hypervisor rooting VM directories under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            machines: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Hypervisor for QemuHypervisor {
    async fn start(&self, spec: VmSpec) -> Result<()> {
        let mut machines = self.machines.lock().await;
        if machines.contains_key(&spec.id) {
            tracing::info!(server_id = %spec.id, "virtual machine already running");
            return Ok(());
        }
        let id = spec.id;
        let machine = VirtualMachine::start(spec, &self.root).await?;
        machine.monitor().cont().await?;
        machines.insert(id, machine);
        Ok(())
    }

    async fn stop(&self, id: ServerId) -> Result<()> {
        let Some(mut machine) = self.machines.lock().await.remove(&id) else {
            tracing::info!(server_id = %id, "no virtual machine to stop");
            return Ok(());
        };
        machine.shutdown().await;
        Ok(())
    }
}
