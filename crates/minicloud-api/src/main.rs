//! `minicloud` binary entrypoint.
//!
//! Connects the coordination backend with a short-TTL session lease,
//! initialises the dynamic options, starts the notification dispatcher
//! and serves the HTTP API.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use minicloud_api::server::AppState;
use minicloud_api::Config;
use minicloud_ceph::RbdStore;
use minicloud_core::{init_logging, LogFormat};
use minicloud_db::{init_options, watch_notifications, Connection, EtcdBackend, KvBackend};
use minicloud_qemu::QemuHypervisor;
use minicloud_reconciler::machines;

const LEASE_TTL_SECS: i64 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_logging(if config.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    });

    let shutdown = CancellationToken::new();
    let backend: Arc<dyn KvBackend> = Arc::new(
        EtcdBackend::connect(
            &config.etcd_endpoints,
            config.etcd_dial_timeout,
            LEASE_TTL_SECS,
            shutdown.clone(),
        )
        .await?,
    );

    init_options(shutdown.clone(), backend.clone()).await?;

    let store = Arc::new(RbdStore::new());
    let hypervisor = Arc::new(QemuHypervisor::new(config.vm_root.clone()));
    let conn = Arc::new(Connection::new(
        backend,
        Arc::new(machines(store.clone(), hypervisor)),
    ));

    watch_notifications(shutdown.clone(), conn.clone()).await?;

    let state = AppState {
        conn,
        store,
        shutdown: shutdown.clone(),
    };

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            ctrl_c.cancel();
        }
    });

    minicloud_api::serve(state, config.listen_addr, shutdown).await?;
    Ok(())
}
