//! The transaction builder.
//!
//! A [`Transaction`] collects guards and mutations and submits them as one
//! atomic backend transaction. Guards implement optimistic concurrency:
//! `create` requires the key to be absent, `update`/`delete` require the
//! modify revision last read. A failed guard applies nothing and surfaces
//! as a conflict, the signal to re-read, re-validate and retry.
//!
//! A serialization failure latches: every later step becomes a no-op and
//! `commit` returns the latched error, so call sites build the whole
//! transaction without per-step error plumbing.

use std::sync::Arc;

use ulid::Ulid;

use minicloud_core::{Error, Result};

use crate::backend::{Compare, KvBackend, TxnOp};
use crate::model::Entity;

/// A one-shot builder of a single atomic multi-op submission.
pub struct Transaction {
    backend: Arc<dyn KvBackend>,
    xid: String,
    err: Option<Error>,
    compares: Vec<Compare>,
    ops: Vec<TxnOp>,
}

impl Transaction {
    pub(crate) fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            xid: Ulid::new().to_string(),
            err: None,
            compares: Vec::new(),
            ops: Vec::new(),
        }
    }

    /// Returns the transaction ID used in conflict reports.
    #[must_use]
    pub fn xid(&self) -> &str {
        &self.xid
    }

    fn serialize<E: Entity>(&mut self, entity: &E) -> Option<Vec<u8>> {
        match serde_json::to_vec(entity) {
            Ok(data) => Some(data),
            Err(e) => {
                tracing::error!(xid = %self.xid, error = %e, "marshal failed");
                self.err = Some(e.into());
                None
            }
        }
    }

    /// Puts a new record, guarded on the key being absent.
    pub fn create<E: Entity>(&mut self, entity: &E) {
        if self.err.is_some() {
            return;
        }
        tracing::debug!(xid = %self.xid, entity = ?entity, "txn create");
        let Some(data) = self.serialize(entity) else { return };
        let key = entity.data_key();
        self.compares.push(Compare::VersionEq(key.clone(), 0));
        self.ops.push(TxnOp::Put {
            key,
            value: data,
            with_lease: false,
        });
    }

    /// Puts an existing record, guarded on presence and the modify revision
    /// observed at load time.
    pub fn update<E: Entity>(&mut self, entity: &E) {
        if self.err.is_some() {
            return;
        }
        tracing::debug!(xid = %self.xid, entity = ?entity, "txn update");
        let Some(data) = self.serialize(entity) else { return };
        let key = entity.data_key();
        self.compares.push(Compare::VersionNe(key.clone(), 0));
        self.compares
            .push(Compare::ModRevisionEq(key.clone(), entity.header().modify_rev));
        self.ops.push(TxnOp::Put {
            key,
            value: data,
            with_lease: false,
        });
    }

    /// Deletes a record, guarded on the modify revision observed at load
    /// time.
    pub fn delete<E: Entity>(&mut self, entity: &E) {
        if self.err.is_some() {
            return;
        }
        tracing::debug!(xid = %self.xid, entity = ?entity, "txn delete");
        let key = entity.data_key();
        self.compares
            .push(Compare::ModRevisionEq(key.clone(), entity.header().modify_rev));
        self.ops.push(TxnOp::Delete { key });
    }

    /// Puts a meta key, guarded on the key being absent (claim semantics).
    pub fn create_meta(&mut self, key: impl Into<String>, content: impl Into<String>) {
        if self.err.is_some() {
            return;
        }
        let key = key.into();
        let content = content.into();
        tracing::debug!(xid = %self.xid, %key, %content, "txn create meta");
        self.compares.push(Compare::VersionEq(key.clone(), 0));
        self.ops.push(TxnOp::Put {
            key,
            value: content.into_bytes(),
            with_lease: false,
        });
    }

    /// Guards on a meta key holding exactly the given content.
    pub fn check_meta(&mut self, key: impl Into<String>, content: impl Into<String>) {
        if self.err.is_some() {
            return;
        }
        let key = key.into();
        let content = content.into();
        tracing::debug!(xid = %self.xid, %key, %content, "txn check meta");
        self.compares
            .push(Compare::ValueEq(key, content.into_bytes()));
    }

    /// Deletes a meta key unconditionally.
    pub fn delete_meta(&mut self, key: impl Into<String>) {
        if self.err.is_some() {
            return;
        }
        let key = key.into();
        tracing::debug!(xid = %self.xid, %key, "txn delete meta");
        self.ops.push(TxnOp::Delete { key });
    }

    /// Claims a lock key: put-if-absent of the session lease id, bound to
    /// the lease so a dead holder's lock expires.
    pub fn acquire_lock(&mut self, key: impl Into<String>) {
        if self.err.is_some() {
            return;
        }
        let key = key.into();
        tracing::debug!(xid = %self.xid, %key, "txn acquire lock");
        self.compares.push(Compare::VersionEq(key.clone(), 0));
        self.ops.push(TxnOp::Put {
            key,
            value: self.backend.lease_hex().into_bytes(),
            with_lease: true,
        });
    }

    /// Releases a lock key, guarded on it still holding this replica's
    /// lease id.
    pub fn release_lock(&mut self, key: impl Into<String>) {
        if self.err.is_some() {
            return;
        }
        let key = key.into();
        tracing::debug!(xid = %self.xid, %key, "txn release lock");
        self.compares
            .push(Compare::ValueEq(key.clone(), self.backend.lease_hex().into_bytes()));
        self.ops.push(TxnOp::Delete { key });
    }

    /// Submits the transaction.
    ///
    /// # Errors
    ///
    /// Returns the latched serialization error if any step failed to
    /// marshal, [`Error::Conflict`] when a guard did not hold, or a backend
    /// error on I/O failure.
    pub async fn commit(self) -> Result<()> {
        if let Some(err) = self.err {
            tracing::debug!(xid = %self.xid, error = %err, "previous error, aborting commit");
            return Err(err);
        }
        tracing::debug!(xid = %self.xid, "committing");
        if self.backend.commit(self.compares, self.ops).await? {
            Ok(())
        } else {
            Err(Error::Conflict { xid: self.xid })
        }
    }
}
