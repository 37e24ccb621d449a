//! etcd implementation of the coordination-backend gateway.
//!
//! The connection owns a session lease with a small TTL, kept alive by a
//! background heartbeat task. Locks are written with this lease so that
//! process death releases them once the TTL lapses.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use etcd_client::{
    Client, Compare as EtcdCompare, CompareOp, ConnectOptions, EventType, GetOptions, PutOptions,
    Txn, TxnOp as EtcdTxnOp, WatchOptions,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use minicloud_core::{Error, Result};

use crate::backend::{Compare, KvBackend, RawValue, TxnOp};

fn backend_err(context: &str, e: etcd_client::Error) -> Error {
    Error::backend_with_source(context.to_string(), e)
}

/// The production backend gateway.
#[derive(Clone)]
pub struct EtcdBackend {
    client: Client,
    lease_id: i64,
}

impl EtcdBackend {
    /// Connects to the etcd cluster, grants the session lease and starts
    /// the keep-alive heartbeat.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the cluster is unreachable or the
    /// lease cannot be granted.
    pub async fn connect(
        endpoints: &[String],
        dial_timeout: Duration,
        lease_ttl_secs: i64,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        tracing::debug!(?endpoints, ?dial_timeout, "connecting to etcd");
        let options = ConnectOptions::new().with_connect_timeout(dial_timeout);
        let mut client = Client::connect(endpoints, Some(options))
            .await
            .map_err(|e| backend_err("failed to connect to etcd cluster", e))?;

        let lease = client
            .lease_grant(lease_ttl_secs, None)
            .await
            .map_err(|e| backend_err("failed to grant session lease", e))?;
        let lease_id = lease.id();
        tracing::info!(lease_id, ttl = lease.ttl(), "connected to etcd cluster");

        let (mut keeper, mut responses) = client
            .lease_keep_alive(lease_id)
            .await
            .map_err(|e| backend_err("failed to start lease keep-alive", e))?;

        // Heartbeat at a third of the TTL; losing the lease releases every
        // lock this replica holds, so a persistent failure is fatal.
        let interval =
            Duration::from_secs(u64::try_from(lease_ttl_secs).unwrap_or(1).div_ceil(3).max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = keeper.keep_alive().await {
                            tracing::error!(error = %e, "lease keep-alive send failed");
                            break;
                        }
                        if let Err(e) = responses.message().await {
                            tracing::error!(error = %e, "lease keep-alive stream failed");
                            break;
                        }
                    }
                }
            }
            tracing::debug!(lease_id, "lease keep-alive stopped");
        });

        Ok(Self { client, lease_id })
    }
}

#[async_trait]
impl KvBackend for EtcdBackend {
    async fn read(&self, key: &str) -> Result<RawValue> {
        let mut kv = self.client.kv_client();
        let resp = kv
            .get(key, Some(GetOptions::new().with_serializable()))
            .await
            .map_err(|e| backend_err("etcd get failed", e))?;

        Ok(match resp.kvs().first() {
            Some(found) => RawValue {
                create_rev: found.create_revision(),
                modify_rev: found.mod_revision(),
                key: key.to_string(),
                data: Bytes::copy_from_slice(found.value()),
            },
            None => RawValue {
                create_rev: 0,
                modify_rev: resp.header().map_or(0, |h| h.revision()),
                key: key.to_string(),
                data: Bytes::new(),
            },
        })
    }

    async fn read_prefix(&self, prefix: &str) -> Result<Vec<RawValue>> {
        let mut kv = self.client.kv_client();
        let resp = kv
            .get(
                prefix,
                Some(GetOptions::new().with_serializable().with_prefix()),
            )
            .await
            .map_err(|e| backend_err("etcd prefix get failed", e))?;

        Ok(resp
            .kvs()
            .iter()
            .map(|found| RawValue {
                create_rev: found.create_revision(),
                modify_rev: found.mod_revision(),
                key: String::from_utf8_lossy(found.key()).into_owned(),
                data: Bytes::copy_from_slice(found.value()),
            })
            .collect())
    }

    fn watch_prefix(
        &self,
        prefix: &str,
        shutdown: CancellationToken,
    ) -> mpsc::UnboundedReceiver<RawValue> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watch_client = self.client.watch_client();
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            tracing::debug!(%prefix, "watching prefix");
            let (mut watcher, mut stream) = match watch_client
                .watch(prefix.as_str(), Some(WatchOptions::new().with_prefix()))
                .await
            {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(%prefix, error = %e, "failed to start watch");
                    return;
                }
            };

            loop {
                let resp = tokio::select! {
                    () = shutdown.cancelled() => break,
                    resp = stream.message() => resp,
                };
                let batch = match resp {
                    Ok(Some(batch)) => batch,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(%prefix, error = %e, "watch stream failed");
                        break;
                    }
                };
                for event in batch.events() {
                    let Some(found) = event.kv() else { continue };
                    let data = if event.event_type() == EventType::Delete {
                        Bytes::new()
                    } else {
                        Bytes::copy_from_slice(found.value())
                    };
                    let value = RawValue {
                        create_rev: found.create_revision(),
                        modify_rev: found.mod_revision(),
                        key: String::from_utf8_lossy(found.key()).into_owned(),
                        data,
                    };
                    if tx.send(value).is_err() {
                        break;
                    }
                }
            }
            let _ = watcher.cancel().await;
            tracing::debug!(%prefix, "stopped watching prefix");
        });

        rx
    }

    async fn commit(&self, compares: Vec<Compare>, ops: Vec<TxnOp>) -> Result<bool> {
        let when: Vec<EtcdCompare> = compares
            .into_iter()
            .map(|cmp| match cmp {
                Compare::VersionEq(key, version) => {
                    EtcdCompare::version(key, CompareOp::Equal, version)
                }
                Compare::VersionNe(key, version) => {
                    EtcdCompare::version(key, CompareOp::NotEqual, version)
                }
                Compare::ModRevisionEq(key, rev) => {
                    EtcdCompare::mod_revision(key, CompareOp::Equal, rev)
                }
                Compare::ValueEq(key, value) => EtcdCompare::value(key, CompareOp::Equal, value),
            })
            .collect();

        let and_then: Vec<EtcdTxnOp> = ops
            .into_iter()
            .map(|op| match op {
                TxnOp::Put { key, value, with_lease } => {
                    let options =
                        with_lease.then(|| PutOptions::new().with_lease(self.lease_id));
                    EtcdTxnOp::put(key, value, options)
                }
                TxnOp::Delete { key } => EtcdTxnOp::delete(key, None),
            })
            .collect();

        let mut kv = self.client.kv_client();
        let resp = kv
            .txn(Txn::new().when(when).and_then(and_then))
            .await
            .map_err(|e| backend_err("etcd transaction failed", e))?;
        Ok(resp.succeeded())
    }

    fn lease_hex(&self) -> String {
        format!("{:x}", self.lease_id)
    }
}
