//! Supervised virtual-machine processes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Child;

use minicloud_core::{Error, Result, ServerId};

use crate::command::{self, MONITOR_SOCKET};
use crate::monitor::Monitor;

/// Host cache mode for a virtual disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiskCache {
    /// Write-through caching.
    WriteThrough,
    /// Write-back caching.
    #[default]
    WriteBack,
    /// No host caching.
    None,
    /// Unsafe caching (no flushes).
    Unsafe,
    /// Direct synchronous I/O.
    DirectSync,
}

impl fmt::Display for DiskCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::WriteThrough => "writethrough",
            Self::WriteBack => "writeback",
            Self::None => "none",
            Self::Unsafe => "unsafe",
            Self::DirectSync => "directsync",
        };
        f.write_str(name)
    }
}

/// One virtual disk attachment.
#[derive(Debug, Clone)]
pub struct VmDisk {
    /// Storage-cluster pool hosting the disk.
    pub pool: String,
    /// Disk object name.
    pub disk: String,
    /// Host cache mode.
    pub cache: DiskCache,
}

/// Everything needed to start a machine.
#[derive(Debug, Clone)]
pub struct VmSpec {
    /// The server this machine backs.
    pub id: ServerId,
    /// Number of virtual CPUs.
    pub num_cpus: i64,
    /// Memory in megabytes.
    pub ram_mb: i64,
    /// VNC display number.
    pub vnc_port: u16,
    /// Attached disks in device order.
    pub disks: Vec<VmDisk>,
}

/// A running, supervised QEMU process with its monitor connection.
pub struct VirtualMachine {
    id: ServerId,
    root: PathBuf,
    child: Child,
    monitor: Monitor,
}

impl VirtualMachine {
    /// Spawns the machine paused and connects its monitor.
    ///
    /// The working directory `<root_base>/<server-id>` holds the monitor
    /// socket and the process logs.
    ///
    /// # Errors
    ///
    /// Returns an external error when the directory, the spawn or the
    /// monitor connection fails. A spawned process is killed when the
    /// monitor never comes up.
    pub async fn start(spec: VmSpec, root_base: &Path) -> Result<Self> {
        let root = root_base.join(spec.id.to_string());
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::external(format!("failed to create vm root: {e}")))?;

        let stdout = std::fs::File::create(root.join("stdout.log"))
            .map_err(|e| Error::external(format!("failed to open vm log: {e}")))?;
        let stderr = std::fs::File::create(root.join("stderr.log"))
            .map_err(|e| Error::external(format!("failed to open vm log: {e}")))?;

        let mut cmd = command::build(&spec, &root);
        cmd.stdout(Stdio::from(stdout));
        cmd.stderr(Stdio::from(stderr));

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::external(format!("failed to spawn qemu: {e}")))?;
        tracing::info!(server_id = %spec.id, pid = child.id(), "qemu spawned");

        let monitor = match Monitor::connect(&root.join(MONITOR_SOCKET)).await {
            Ok(monitor) => monitor,
            Err(e) => {
                tracing::error!(server_id = %spec.id, error = %e, "monitor never came up, killing vm");
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(e);
            }
        };

        Ok(Self {
            id: spec.id,
            root,
            child,
            monitor,
        })
    }

    /// Returns the monitor connection.
    #[must_use]
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// Returns the machine's working directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stops the machine: graceful `quit` through the monitor, kill when
    /// that fails or the process lingers.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.monitor.quit().await {
            tracing::error!(server_id = %self.id, error = %e, "failed to quit vm, killing");
            let _ = self.child.start_kill();
        }
        match tokio::time::timeout(Duration::from_secs(10), self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(server_id = %self.id, %status, "vm exited");
            }
            Ok(Err(e)) => {
                tracing::error!(server_id = %self.id, error = %e, "failed to reap vm");
            }
            Err(_) => {
                tracing::error!(server_id = %self.id, "vm did not exit, killing");
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
        }
    }
}
