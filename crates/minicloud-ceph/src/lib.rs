//! # minicloud-ceph
//!
//! Block-storage driver for the MiniCloud control plane.
//!
//! The [`BlockStore`] trait is the contract the reconciliation hooks and
//! the upload flow program against: disk create/clone/resize/delete and
//! image import/delete. [`RbdStore`] implements it against a Ceph cluster
//! through the `rbd` tool; [`MemoryBlockStore`] implements it in process
//! for tests.
//!
//! Image bytes live in the fixed `images` pool; every imported image gets
//! a protected `base` snapshot which disk clones branch from.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod memory;
pub mod rbd;

use std::sync::LazyLock;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use minicloud_core::config::{self, ConfigOption};
use minicloud_core::Result;

pub use memory::MemoryBlockStore;
pub use rbd::RbdStore;

/// The pool hosting image bytes.
pub const IMAGE_POOL: &str = "images";

/// The snapshot name disk clones branch from.
pub const BASE_SNAPSHOT: &str = "base";

/// Storage-cluster monitor address.
pub static OPT_MON_HOST: LazyLock<&'static ConfigOption<String>> =
    LazyLock::new(|| config::string_opt("ceph_mon_host", "127.0.0.1"));

/// Storage-cluster authentication key (empty = none).
pub static OPT_KEY: LazyLock<&'static ConfigOption<String>> =
    LazyLock::new(|| config::string_opt("ceph_key", ""));

/// Object-size order (2^n bytes) for image objects.
pub static OPT_IMAGE_ORDER: LazyLock<&'static ConfigOption<i64>> =
    LazyLock::new(|| config::int_opt("ceph_image_order", 18));

/// Object-size order (2^n bytes) for disk objects.
pub static OPT_DISK_ORDER: LazyLock<&'static ConfigOption<i64>> =
    LazyLock::new(|| config::int_opt("ceph_disk_order", 18));

/// A stream of raw content bytes, e.g. an HTTP upload body.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// The block-storage operations the control plane depends on.
///
/// Every operation is idempotent at this boundary: creating an object
/// that already exists and deleting one that is already gone both
/// succeed, because a hook may be re-run after a replica crash.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Creates an empty disk of `size` bytes in `pool`.
    async fn create_disk(&self, pool: &str, name: &str, size: u64) -> Result<()>;

    /// Clones a disk from an image's `base` snapshot, then grows it to
    /// `size` bytes.
    async fn clone_from_image(
        &self,
        pool: &str,
        name: &str,
        image_name: &str,
        size: u64,
    ) -> Result<()>;

    /// Resizes a disk to `size` bytes; a matching current size is a no-op.
    async fn resize_disk(&self, pool: &str, name: &str, size: u64) -> Result<()>;

    /// Deletes a disk; a missing disk is a success.
    async fn delete_disk(&self, pool: &str, name: &str) -> Result<()>;

    /// Imports `content` into the image pool under `name` and creates the
    /// protected `base` snapshot. `size` is the declared content length.
    async fn import_image(&self, name: &str, size: u64, content: ByteStream) -> Result<()>;

    /// Deletes an image and its snapshots; a missing image is a success.
    async fn delete_image(&self, name: &str) -> Result<()>;
}
