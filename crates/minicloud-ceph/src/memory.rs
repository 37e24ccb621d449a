//! In-memory block-storage implementation for testing.
//!
//! Mirrors the driver contract, including idempotence (create of an
//! existing object and delete of a missing one both succeed). A failure
//! switch lets tests exercise the hooks' error paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;

use minicloud_core::{Error, Result};

use crate::{BlockStore, ByteStream};

#[derive(Debug, Clone)]
struct StoredDisk {
    size: u64,
    cloned_from: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredImage {
    data: Vec<u8>,
    protected: bool,
}

#[derive(Default)]
struct Inner {
    disks: HashMap<(String, String), StoredDisk>,
    images: HashMap<String, StoredImage>,
    creates: usize,
}

/// In-memory test double for [`BlockStore`].
#[derive(Default)]
pub struct MemoryBlockStore {
    inner: Mutex<Inner>,
    failing: AtomicBool,
}

impl MemoryBlockStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_failing(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(Error::external("injected storage failure"))
        } else {
            Ok(())
        }
    }

    /// Returns whether a disk exists.
    #[must_use]
    pub fn disk_exists(&self, pool: &str, name: &str) -> bool {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .disks
            .contains_key(&(pool.to_string(), name.to_string()))
    }

    /// Returns a disk's size, if it exists.
    #[must_use]
    pub fn disk_size(&self, pool: &str, name: &str) -> Option<u64> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .disks
            .get(&(pool.to_string(), name.to_string()))
            .map(|d| d.size)
    }

    /// Returns an image's content, if it exists.
    #[must_use]
    pub fn image_data(&self, name: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .images
            .get(name)
            .map(|i| i.data.clone())
    }

    /// Returns how many disk create/clone operations actually created an
    /// object (idempotent re-runs not counted).
    #[must_use]
    pub fn disk_creates(&self) -> usize {
        self.inner.lock().expect("store lock poisoned").creates
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn create_disk(&self, pool: &str, name: &str, size: u64) -> Result<()> {
        self.check_failing()?;
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let key = (pool.to_string(), name.to_string());
        if inner.disks.contains_key(&key) {
            return Ok(());
        }
        inner.disks.insert(
            key,
            StoredDisk {
                size,
                cloned_from: None,
            },
        );
        inner.creates += 1;
        Ok(())
    }

    async fn clone_from_image(
        &self,
        pool: &str,
        name: &str,
        image_name: &str,
        size: u64,
    ) -> Result<()> {
        self.check_failing()?;
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let Some(image) = inner.images.get(image_name) else {
            return Err(Error::external(format!("image {image_name} does not exist")));
        };
        if !image.protected {
            return Err(Error::external(format!(
                "image {image_name} has no protected base snapshot"
            )));
        }
        let key = (pool.to_string(), name.to_string());
        if inner.disks.contains_key(&key) {
            return Ok(());
        }
        inner.disks.insert(
            key,
            StoredDisk {
                size,
                cloned_from: Some(image_name.to_string()),
            },
        );
        inner.creates += 1;
        Ok(())
    }

    async fn resize_disk(&self, pool: &str, name: &str, size: u64) -> Result<()> {
        self.check_failing()?;
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let key = (pool.to_string(), name.to_string());
        match inner.disks.get_mut(&key) {
            Some(disk) => {
                disk.size = size;
                Ok(())
            }
            None => Err(Error::external(format!("disk {pool}/{name} does not exist"))),
        }
    }

    async fn delete_disk(&self, pool: &str, name: &str) -> Result<()> {
        self.check_failing()?;
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.disks.remove(&(pool.to_string(), name.to_string()));
        Ok(())
    }

    async fn import_image(&self, name: &str, _size: u64, mut content: ByteStream) -> Result<()> {
        self.check_failing()?;
        let mut data = Vec::new();
        while let Some(chunk) = content.next().await {
            let chunk = chunk.map_err(|e| Error::external(format!("image upload error: {e}")))?;
            data.extend_from_slice(&chunk);
        }
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.images.insert(
            name.to_string(),
            StoredImage {
                data,
                protected: true,
            },
        );
        Ok(())
    }

    async fn delete_image(&self, name: &str) -> Result<()> {
        self.check_failing()?;
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let in_use = inner
            .disks
            .values()
            .any(|d| d.cloned_from.as_deref() == Some(name));
        if in_use {
            return Err(Error::external(format!("image {name} has children")));
        }
        inner.images.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn content(bytes: &'static [u8]) -> ByteStream {
        Box::pin(stream::iter(vec![Ok(bytes::Bytes::from_static(bytes))]))
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let store = MemoryBlockStore::new();
        store.create_disk("vols", "d1", 100).await.unwrap();
        store.create_disk("vols", "d1", 100).await.unwrap();
        assert_eq!(store.disk_creates(), 1);
    }

    #[tokio::test]
    async fn clone_requires_imported_image() {
        let store = MemoryBlockStore::new();
        assert!(store
            .clone_from_image("vols", "d1", "ubuntu", 100)
            .await
            .is_err());

        store.import_image("ubuntu", 4, content(b"ABCD")).await.unwrap();
        store
            .clone_from_image("vols", "d1", "ubuntu", 100)
            .await
            .unwrap();
        assert_eq!(store.disk_size("vols", "d1"), Some(100));
    }

    #[tokio::test]
    async fn image_with_children_cannot_be_deleted() {
        let store = MemoryBlockStore::new();
        store.import_image("ubuntu", 4, content(b"ABCD")).await.unwrap();
        store
            .clone_from_image("vols", "d1", "ubuntu", 100)
            .await
            .unwrap();
        assert!(store.delete_image("ubuntu").await.is_err());

        store.delete_disk("vols", "d1").await.unwrap();
        store.delete_image("ubuntu").await.unwrap();
        assert!(store.image_data("ubuntu").is_none());
    }

    #[tokio::test]
    async fn failure_switch_breaks_everything() {
        let store = MemoryBlockStore::new();
        store.set_failing(true);
        assert!(store.create_disk("vols", "d1", 1).await.is_err());
        store.set_failing(false);
        assert!(store.create_disk("vols", "d1", 1).await.is_ok());
    }
}
