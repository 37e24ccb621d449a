//! In-memory coordination backend for testing.
//!
//! Models the backend semantics the control plane depends on: monotonic
//! revisions, per-key put-versions, atomic multi-op CAS transactions,
//! prefix watches and session leases. A [`MemoryCluster`] is shared state;
//! every [`MemoryCluster::connect`] hands out a handle with its own lease,
//! so multi-replica scenarios (lock contention, replica death) run in one
//! process. Not suitable for production.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use minicloud_core::Result;

use crate::backend::{Compare, KvBackend, RawValue, TxnOp};

#[derive(Debug, Clone)]
struct Stored {
    data: Bytes,
    create_rev: i64,
    mod_rev: i64,
    version: i64,
    lease: Option<u64>,
}

struct WatchEntry {
    prefix: String,
    tx: mpsc::UnboundedSender<RawValue>,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct ClusterState {
    keys: BTreeMap<String, Stored>,
    revision: i64,
    next_lease: u64,
    watchers: Vec<WatchEntry>,
}

impl ClusterState {
    fn broadcast(&mut self, event: &RawValue) {
        self.watchers.retain(|w| {
            if w.shutdown.is_cancelled() {
                return false;
            }
            if event.key.starts_with(&w.prefix) {
                w.tx.send(event.clone()).is_ok()
            } else {
                true
            }
        });
    }

    fn check(&self, cmp: &Compare) -> bool {
        match cmp {
            Compare::VersionEq(key, version) => {
                self.keys.get(key).map_or(0, |s| s.version) == *version
            }
            Compare::VersionNe(key, version) => {
                self.keys.get(key).map_or(0, |s| s.version) != *version
            }
            Compare::ModRevisionEq(key, rev) => {
                self.keys.get(key).is_some_and(|s| s.mod_rev == *rev)
            }
            Compare::ValueEq(key, value) => {
                self.keys.get(key).is_some_and(|s| s.data.as_ref() == value.as_slice())
            }
        }
    }

    fn apply(&mut self, op: TxnOp, lease: u64) {
        match op {
            TxnOp::Put { key, value, with_lease } => {
                let rev = self.revision;
                let entry = self.keys.entry(key.clone()).or_insert(Stored {
                    data: Bytes::new(),
                    create_rev: rev,
                    mod_rev: rev,
                    version: 0,
                    lease: None,
                });
                entry.data = Bytes::from(value);
                entry.mod_rev = rev;
                entry.version += 1;
                entry.lease = with_lease.then_some(lease);
                let event = RawValue {
                    create_rev: entry.create_rev,
                    modify_rev: rev,
                    key,
                    data: entry.data.clone(),
                };
                self.broadcast(&event);
            }
            TxnOp::Delete { key } => {
                if self.keys.remove(&key).is_some() {
                    let event = RawValue {
                        create_rev: 0,
                        modify_rev: self.revision,
                        key,
                        data: Bytes::new(),
                    };
                    self.broadcast(&event);
                }
            }
        }
    }
}

/// A shared in-memory backend cluster.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    inner: Arc<Mutex<ClusterState>>,
}

impl MemoryCluster {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a new replica handle with its own session lease.
    #[must_use]
    pub fn connect(&self) -> MemoryBackend {
        let lease = {
            let mut state = self.inner.lock().expect("cluster lock poisoned");
            state.next_lease += 1;
            state.next_lease
        };
        MemoryBackend {
            inner: self.inner.clone(),
            lease,
        }
    }

    /// Expires a session lease, deleting every key bound to it.
    ///
    /// Simulates the backend reclaiming a dead replica's locks; delete
    /// events are delivered to watchers as usual.
    pub fn expire_lease(&self, lease_hex: &str) {
        let mut state = self.inner.lock().expect("cluster lock poisoned");
        let doomed: Vec<String> = state
            .keys
            .iter()
            .filter(|(_, s)| s.lease.is_some_and(|l| format!("{l:x}") == lease_hex))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            state.revision += 1;
            state.apply(TxnOp::Delete { key }, 0);
        }
    }
}

/// One replica's handle onto a [`MemoryCluster`].
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Mutex<ClusterState>>,
    lease: u64,
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn read(&self, key: &str) -> Result<RawValue> {
        let state = self.inner.lock().expect("cluster lock poisoned");
        Ok(match state.keys.get(key) {
            Some(stored) => RawValue {
                create_rev: stored.create_rev,
                modify_rev: stored.mod_rev,
                key: key.to_string(),
                data: stored.data.clone(),
            },
            None => RawValue {
                create_rev: 0,
                modify_rev: state.revision,
                key: key.to_string(),
                data: Bytes::new(),
            },
        })
    }

    async fn read_prefix(&self, prefix: &str) -> Result<Vec<RawValue>> {
        let state = self.inner.lock().expect("cluster lock poisoned");
        Ok(state
            .keys
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, s)| RawValue {
                create_rev: s.create_rev,
                modify_rev: s.mod_rev,
                key: k.clone(),
                data: s.data.clone(),
            })
            .collect())
    }

    fn watch_prefix(
        &self,
        prefix: &str,
        shutdown: CancellationToken,
    ) -> mpsc::UnboundedReceiver<RawValue> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.lock().expect("cluster lock poisoned");
        state.watchers.push(WatchEntry {
            prefix: prefix.to_string(),
            tx,
            shutdown,
        });
        rx
    }

    async fn commit(&self, compares: Vec<Compare>, ops: Vec<TxnOp>) -> Result<bool> {
        let mut state = self.inner.lock().expect("cluster lock poisoned");
        if !compares.iter().all(|cmp| state.check(cmp)) {
            return Ok(false);
        }
        // All ops of one transaction commit at a single revision.
        state.revision += 1;
        for op in ops {
            state.apply(op, self.lease);
        }
        Ok(true)
    }

    fn lease_hex(&self) -> String {
        format!("{:x}", self.lease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_missing_key_carries_current_revision() {
        let cluster = MemoryCluster::new();
        let backend = cluster.connect();
        backend
            .commit(
                vec![],
                vec![TxnOp::Put {
                    key: "/a".into(),
                    value: b"1".to_vec(),
                    with_lease: false,
                }],
            )
            .await
            .unwrap();

        let missing = backend.read("/b").await.unwrap();
        assert!(missing.is_absent());
        assert_eq!(missing.modify_rev, 1);
    }

    #[tokio::test]
    async fn version_guard_enforces_put_if_absent() {
        let cluster = MemoryCluster::new();
        let backend = cluster.connect();
        let put = |value: &[u8]| {
            (
                vec![Compare::VersionEq("/k".into(), 0)],
                vec![TxnOp::Put {
                    key: "/k".into(),
                    value: value.to_vec(),
                    with_lease: false,
                }],
            )
        };

        let (cmps, ops) = put(b"first");
        assert!(backend.commit(cmps, ops).await.unwrap());
        let (cmps, ops) = put(b"second");
        assert!(!backend.commit(cmps, ops).await.unwrap());
        assert_eq!(backend.read("/k").await.unwrap().data.as_ref(), b"first");
    }

    #[tokio::test]
    async fn mod_revision_guard_detects_concurrent_write() {
        let cluster = MemoryCluster::new();
        let backend = cluster.connect();
        backend
            .commit(
                vec![],
                vec![TxnOp::Put {
                    key: "/k".into(),
                    value: b"v1".to_vec(),
                    with_lease: false,
                }],
            )
            .await
            .unwrap();
        let seen = backend.read("/k").await.unwrap().modify_rev;

        // Another writer intervenes.
        backend
            .commit(
                vec![],
                vec![TxnOp::Put {
                    key: "/k".into(),
                    value: b"v2".to_vec(),
                    with_lease: false,
                }],
            )
            .await
            .unwrap();

        let stale = backend
            .commit(
                vec![Compare::ModRevisionEq("/k".into(), seen)],
                vec![TxnOp::Put {
                    key: "/k".into(),
                    value: b"v3".to_vec(),
                    with_lease: false,
                }],
            )
            .await
            .unwrap();
        assert!(!stale);
    }

    #[tokio::test]
    async fn watch_sees_puts_and_deletes_in_order() {
        let cluster = MemoryCluster::new();
        let backend = cluster.connect();
        let shutdown = CancellationToken::new();
        let mut rx = backend.watch_prefix("/watched/", shutdown.clone());

        backend
            .commit(
                vec![],
                vec![
                    TxnOp::Put {
                        key: "/watched/a".into(),
                        value: b"x".to_vec(),
                        with_lease: false,
                    },
                    TxnOp::Put {
                        key: "/elsewhere/b".into(),
                        value: b"y".to_vec(),
                        with_lease: false,
                    },
                ],
            )
            .await
            .unwrap();
        backend
            .commit(vec![], vec![TxnOp::Delete { key: "/watched/a".into() }])
            .await
            .unwrap();

        let put = rx.recv().await.unwrap();
        assert_eq!(put.key, "/watched/a");
        assert!(!put.is_absent());
        let del = rx.recv().await.unwrap();
        assert_eq!(del.key, "/watched/a");
        assert!(del.is_absent());
        assert!(del.modify_rev > put.modify_rev);
    }

    #[tokio::test]
    async fn lease_expiry_deletes_bound_keys() {
        let cluster = MemoryCluster::new();
        let replica_a = cluster.connect();
        let replica_b = cluster.connect();
        assert_ne!(replica_a.lease_hex(), replica_b.lease_hex());

        replica_a
            .commit(
                vec![],
                vec![TxnOp::Put {
                    key: "/lock".into(),
                    value: replica_a.lease_hex().into_bytes(),
                    with_lease: true,
                }],
            )
            .await
            .unwrap();

        cluster.expire_lease(&replica_a.lease_hex());
        assert!(replica_b.read("/lock").await.unwrap().is_absent());
    }
}
