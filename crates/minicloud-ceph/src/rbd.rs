//! `rbd`-tool implementation of the block-storage driver.
//!
//! Each operation runs the `rbd` CLI against the cluster named by the
//! `ceph_mon_host`/`ceph_key` options. Object sizes derive from the
//! `ceph_image_order`/`ceph_disk_order` options (2^order bytes).

use std::process::Stdio;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use minicloud_core::{Error, Result};

use crate::{
    BlockStore, ByteStream, BASE_SNAPSHOT, IMAGE_POOL, OPT_DISK_ORDER, OPT_IMAGE_ORDER, OPT_KEY,
    OPT_MON_HOST,
};

#[derive(Debug, Deserialize)]
struct RbdInfo {
    size: u64,
}

// `protected` is a string in some rbd releases and a bool in others.
#[derive(Debug, Deserialize)]
struct RbdSnapshot {
    name: String,
    #[serde(default)]
    protected: serde_json::Value,
}

impl RbdSnapshot {
    fn is_protected(&self) -> bool {
        self.protected == serde_json::Value::Bool(true) || self.protected == "true"
    }
}

/// Block-storage driver shelling out to the `rbd` tool.
#[derive(Debug, Clone, Default)]
pub struct RbdStore;

impl RbdStore {
    /// Creates the driver.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("rbd");
        cmd.arg("-m").arg(OPT_MON_HOST.value());
        let key = OPT_KEY.value();
        if !key.is_empty() {
            cmd.arg("--key").arg(key);
        }
        cmd.args(args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        tracing::debug!(?args, "running rbd");
        let output = self
            .command(args)
            .output()
            .await
            .map_err(|e| Error::external(format!("failed to spawn rbd: {e}")))?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(Error::external(format!(
                "rbd {} failed: {}",
                args.first().copied().unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn info(&self, spec: &str) -> Result<Option<RbdInfo>> {
        match self.run(&["info", "--format", "json", spec]).await {
            Ok(stdout) => {
                let info: RbdInfo = serde_json::from_slice(&stdout)
                    .map_err(|e| Error::external(format!("failed to parse rbd info: {e}")))?;
                Ok(Some(info))
            }
            // `rbd info` on a missing object exits non-zero; treat any
            // failure here as absence and let the mutating call report
            // real cluster trouble.
            Err(_) => Ok(None),
        }
    }

    fn object_size(order: i64) -> String {
        format!("{}B", 1u64 << order.clamp(12, 25))
    }
}

#[async_trait]
impl BlockStore for RbdStore {
    async fn create_disk(&self, pool: &str, name: &str, size: u64) -> Result<()> {
        let spec = format!("{pool}/{name}");
        if self.info(&spec).await?.is_some() {
            tracing::info!(pool, name, "disk already exists");
            return Ok(());
        }
        let size_arg = format!("{size}B");
        let object_size = Self::object_size(OPT_DISK_ORDER.value());
        self.run(&[
            "create",
            "--size",
            &size_arg,
            "--object-size",
            &object_size,
            &spec,
        ])
        .await?;
        tracing::info!(pool, name, size, "created empty disk");
        Ok(())
    }

    async fn clone_from_image(
        &self,
        pool: &str,
        name: &str,
        image_name: &str,
        size: u64,
    ) -> Result<()> {
        let spec = format!("{pool}/{name}");
        let parent = format!("{IMAGE_POOL}/{image_name}@{BASE_SNAPSHOT}");
        if self.info(&spec).await?.is_none() {
            let object_size = Self::object_size(OPT_DISK_ORDER.value());
            self.run(&["clone", "--object-size", &object_size, &parent, &spec])
                .await?;
        } else {
            tracing::info!(pool, name, "clone already exists");
        }
        self.resize_disk(pool, name, size).await?;
        tracing::info!(pool, name, image = image_name, size, "created disk from image");
        Ok(())
    }

    async fn resize_disk(&self, pool: &str, name: &str, size: u64) -> Result<()> {
        let spec = format!("{pool}/{name}");
        let current = self
            .info(&spec)
            .await?
            .ok_or_else(|| Error::external(format!("disk {spec} does not exist")))?;
        if current.size == size {
            tracing::info!(pool, name, size, "size not changed");
            return Ok(());
        }
        let size_arg = format!("{size}B");
        if size < current.size {
            self.run(&["resize", "--allow-shrink", "--size", &size_arg, &spec])
                .await?;
        } else {
            self.run(&["resize", "--size", &size_arg, &spec]).await?;
        }
        tracing::info!(pool, name, size, "disk resized");
        Ok(())
    }

    async fn delete_disk(&self, pool: &str, name: &str) -> Result<()> {
        let spec = format!("{pool}/{name}");
        if self.info(&spec).await?.is_none() {
            tracing::info!(pool, name, "disk didn't exist");
            return Ok(());
        }
        self.run(&["rm", &spec]).await?;
        tracing::info!(pool, name, "disk removed");
        Ok(())
    }

    async fn import_image(&self, name: &str, size: u64, mut content: ByteStream) -> Result<()> {
        let spec = format!("{IMAGE_POOL}/{name}");
        if self.info(&spec).await?.is_some() {
            tracing::info!(name, "image already exists");
            return Ok(());
        }

        let object_size = Self::object_size(OPT_IMAGE_ORDER.value());
        let mut cmd = self.command(&["import", "--object-size", &object_size, "-", &spec]);
        cmd.stdin(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::external(format!("failed to spawn rbd import: {e}")))?;

        let mut stdin = child.stdin.take().expect("stdin was piped");
        // Owns the pipe: dropping it on any exit closes the child's stdin.
        let feed = async move {
            let mut uploaded: u64 = 0;
            while let Some(chunk) = content.next().await {
                let chunk =
                    chunk.map_err(|e| Error::external(format!("image upload error: {e}")))?;
                uploaded += chunk.len() as u64;
                stdin
                    .write_all(&chunk)
                    .await
                    .map_err(|e| Error::external(format!("rbd import write failed: {e}")))?;
            }
            stdin
                .shutdown()
                .await
                .map_err(|e| Error::external(format!("rbd import close failed: {e}")))?;
            Ok::<u64, Error>(uploaded)
        };

        let import_result = feed.await;
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::external(format!("rbd import failed: {e}")))?;
        let uploaded = match import_result {
            Ok(uploaded) => uploaded,
            Err(e) => {
                let _ = self.run(&["rm", &spec]).await;
                return Err(e);
            }
        };
        if !output.status.success() {
            let _ = self.run(&["rm", &spec]).await;
            return Err(Error::external(format!(
                "rbd import failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if uploaded != size {
            tracing::warn!(name, declared = size, uploaded, "upload length mismatch");
        }
        tracing::info!(name, size = uploaded, "image uploaded");

        let snap = format!("{spec}@{BASE_SNAPSHOT}");
        if let Err(e) = self.run(&["snap", "create", &snap]).await {
            let _ = self.run(&["rm", &spec]).await;
            return Err(e);
        }
        if let Err(e) = self.run(&["snap", "protect", &snap]).await {
            let _ = self.run(&["snap", "rm", &snap]).await;
            let _ = self.run(&["rm", &spec]).await;
            return Err(e);
        }
        tracing::info!(name, "created image");
        Ok(())
    }

    async fn delete_image(&self, name: &str) -> Result<()> {
        let spec = format!("{IMAGE_POOL}/{name}");
        if self.info(&spec).await?.is_none() {
            tracing::info!(name, "image didn't exist");
            return Ok(());
        }

        let stdout = self.run(&["snap", "ls", "--format", "json", &spec]).await?;
        let snapshots: Vec<RbdSnapshot> = serde_json::from_slice(&stdout)
            .map_err(|e| Error::external(format!("failed to parse snapshot list: {e}")))?;
        for snapshot in snapshots {
            let snap = format!("{spec}@{}", snapshot.name);
            if snapshot.is_protected() {
                self.run(&["snap", "unprotect", &snap]).await?;
            }
            self.run(&["snap", "rm", &snap]).await?;
        }

        self.run(&["rm", &spec]).await?;
        tracing::info!(name, "image removed");
        Ok(())
    }
}
