//! Dynamic-option wiring.
//!
//! Bridges the backend's `/minicloud/config/global/` prefix into the
//! process-wide option catalogue in `minicloud_core::config`: one initial
//! prefix read for current values, then a live watch. Revision-based
//! staleness is handled by the catalogue itself.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use minicloud_core::{config, Result};

use crate::backend::{KvBackend, RawValue};
use crate::keys::CONFIG_PREFIX;

fn apply_raw(raw: &RawValue) {
    let Some(name) = raw.key.strip_prefix(CONFIG_PREFIX) else {
        return;
    };
    let data = if raw.is_absent() {
        None
    } else {
        Some(raw.data.as_ref())
    };
    config::apply(name, data, raw.modify_rev);
}

/// Reads current option values and keeps them updated until `shutdown`.
///
/// # Errors
///
/// Returns a backend error when the initial prefix read fails.
pub async fn init_options(
    shutdown: CancellationToken,
    backend: Arc<dyn KvBackend>,
) -> Result<()> {
    let mut events = backend.watch_prefix(CONFIG_PREFIX, shutdown.clone());
    for raw in backend.read_prefix(CONFIG_PREFIX).await? {
        apply_raw(&raw);
    }
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                event = events.recv() => {
                    let Some(raw) = event else { break };
                    apply_raw(&raw);
                }
            }
        }
        tracing::debug!("stopped watching configuration options");
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TxnOp;
    use crate::keys::config_key;
    use crate::memory::MemoryCluster;
    use minicloud_core::config::ConfigOption;
    use std::sync::LazyLock;
    use std::time::Duration;

    static OPT_TEST_WATCHED: LazyLock<&'static ConfigOption<i64>> =
        LazyLock::new(|| config::int_opt("test_watched_int", 100));

    #[tokio::test]
    async fn options_follow_backend_writes() {
        let cluster = MemoryCluster::new();
        let backend: Arc<dyn KvBackend> = Arc::new(cluster.connect());
        let shutdown = CancellationToken::new();

        assert_eq!(OPT_TEST_WATCHED.value(), 100);
        init_options(shutdown.clone(), backend.clone()).await.unwrap();

        backend
            .commit(
                vec![],
                vec![TxnOp::Put {
                    key: config_key("test_watched_int"),
                    value: b"250".to_vec(),
                    with_lease: false,
                }],
            )
            .await
            .unwrap();

        // The watch task applies the update asynchronously.
        for _ in 0..50 {
            if OPT_TEST_WATCHED.value() == 250 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(OPT_TEST_WATCHED.value(), 250);

        shutdown.cancel();
    }
}
