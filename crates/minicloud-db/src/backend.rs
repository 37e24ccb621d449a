//! Coordination-backend gateway contract.
//!
//! The backend is a strongly-consistent key-value store providing
//! serializable reads, prefix watches, a session lease and multi-op
//! compare-and-set transactions. [`EtcdBackend`](crate::etcd::EtcdBackend)
//! is the production implementation; [`MemoryCluster`](crate::memory::MemoryCluster)
//! provides the same semantics in process for tests.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use minicloud_core::Result;

/// One key/value observation: a point read result or a watch event.
///
/// Empty `data` means the key is absent (on read) or was deleted (on
/// watch). A read of a missing key still carries the current global
/// revision in `modify_rev` so callers can order it against watch events.
#[derive(Debug, Clone)]
pub struct RawValue {
    /// Revision at which the key was created (0 when absent).
    pub create_rev: i64,
    /// Revision of the last modification, or the current global revision
    /// for a read of a missing key.
    pub modify_rev: i64,
    /// The full backend key.
    pub key: String,
    /// The value bytes; empty for deletes and missing keys.
    pub data: Bytes,
}

impl RawValue {
    /// Returns whether this observation carries no value.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        self.data.is_empty()
    }
}

/// A transaction guard, evaluated atomically before any op is applied.
#[derive(Debug, Clone)]
pub enum Compare {
    /// The key's put-version equals the given value (0 = key absent).
    VersionEq(String, i64),
    /// The key's put-version differs from the given value.
    VersionNe(String, i64),
    /// The key's modify revision equals the given value.
    ModRevisionEq(String, i64),
    /// The key's value equals the given bytes.
    ValueEq(String, Vec<u8>),
}

/// A transaction mutation, applied only if every guard holds.
#[derive(Debug, Clone)]
pub enum TxnOp {
    /// Put `key = value`, optionally bound to the session lease.
    Put {
        /// Target key.
        key: String,
        /// Value bytes.
        value: Vec<u8>,
        /// Attach the session lease so the key dies with the replica.
        with_lease: bool,
    },
    /// Delete the key (no-op when absent).
    Delete {
        /// Target key.
        key: String,
    },
}

/// The coordination-backend gateway.
///
/// All methods are cancel-safe from the caller's perspective; connection
/// loss surfaces as a backend error which the retry helper treats as
/// non-retriable.
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    /// Serializable point read.
    async fn read(&self, key: &str) -> Result<RawValue>;

    /// Serializable prefix read.
    async fn read_prefix(&self, prefix: &str) -> Result<Vec<RawValue>>;

    /// Streams put/delete events under a prefix until `shutdown` fires.
    ///
    /// Delete events carry empty data. The stream closes on shutdown or
    /// when the backend watch terminates.
    fn watch_prefix(
        &self,
        prefix: &str,
        shutdown: CancellationToken,
    ) -> mpsc::UnboundedReceiver<RawValue>;

    /// Submits guards and ops as one atomic transaction.
    ///
    /// Returns `Ok(true)` when all guards held and the ops were applied,
    /// `Ok(false)` when a guard failed and nothing was applied.
    async fn commit(&self, compares: Vec<Compare>, ops: Vec<TxnOp>) -> Result<bool>;

    /// The session lease identity as lowercase hex.
    ///
    /// Lock keys are written with this value and bound to the lease, so a
    /// dead replica's locks disappear when its lease expires.
    fn lease_hex(&self) -> String;
}
