//! End-to-end reconciliation over the in-memory backend and drivers:
//! intent committed through managers, notifications dispatched, hooks
//! driving the storage cluster and hypervisor doubles.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use tokio_util::sync::CancellationToken;

use minicloud_ceph::{BlockStore, ByteStream, MemoryBlockStore};
use minicloud_core::{Initiator, Result, ServerId, State};
use minicloud_db::memory::MemoryCluster;
use minicloud_db::model::{Disk, Entity, Flavor, Image, Project, Server};
use minicloud_db::{watch_notifications, Connection};
use minicloud_qemu::{Hypervisor, VmSpec};
use minicloud_reconciler::machines;

/// Hypervisor double recording starts and stops.
#[derive(Default)]
struct FakeHypervisor {
    running: Mutex<HashSet<ServerId>>,
    starts: AtomicUsize,
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn start(&self, spec: VmSpec) -> Result<()> {
        let mut running = self.running.lock().unwrap();
        if running.insert(spec.id) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn stop(&self, id: ServerId) -> Result<()> {
        self.running.lock().unwrap().remove(&id);
        Ok(())
    }
}

struct Harness {
    conn: Arc<Connection>,
    store: Arc<MemoryBlockStore>,
    hypervisor: Arc<FakeHypervisor>,
    shutdown: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn harness() -> Harness {
    let cluster = MemoryCluster::new();
    let store = Arc::new(MemoryBlockStore::new());
    let hypervisor = Arc::new(FakeHypervisor::default());
    let conn = Arc::new(Connection::new(
        Arc::new(cluster.connect()),
        Arc::new(machines(store.clone(), hypervisor.clone())),
    ));
    let shutdown = CancellationToken::new();
    watch_notifications(shutdown.clone(), conn.clone())
        .await
        .unwrap();
    Harness {
        conn,
        store,
        hypervisor,
        shutdown,
    }
}

async fn create_project(conn: &Connection) -> Project {
    let mut project = conn.projects().new_entity();
    project.name = "alpha".into();
    conn.projects().create(&mut project).await.unwrap();
    conn.projects().get(project.header.id).await.unwrap()
}

async fn create_flavor(conn: &Connection) -> Flavor {
    let mut flavor = conn.flavors().new_entity();
    flavor.name = "small".into();
    flavor.num_cpus = 2;
    flavor.ram = 2048;
    conn.flavors().create(&mut flavor).await.unwrap();
    conn.flavors().get(flavor.header.id).await.unwrap()
}

async fn wait_for_disk_state(conn: &Connection, id: minicloud_core::DiskId, state: State) -> Disk {
    for _ in 0..300 {
        let disk = conn.disks().get(id).await.unwrap();
        if disk.state() == state {
            return disk;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("disk never reached {state}");
}

async fn wait_for_server_state(conn: &Connection, id: ServerId, state: State) -> Server {
    for _ in 0..300 {
        let server = conn.servers().get(id).await.unwrap();
        if server.state() == state {
            return server;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server never reached {state}");
}

async fn wait_gone<F, Fut>(mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if probe().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("record never disappeared");
}

fn content(bytes: &'static [u8]) -> ByteStream {
    Box::pin(stream::iter(vec![Ok(bytes::Bytes::from_static(bytes))]))
}

/// Imports image bytes and walks the record to `Ready` like the upload
/// flow does.
async fn ready_image(harness: &Harness, project: &Project) -> Image {
    let conn = &harness.conn;
    let mut image = conn.images().new_entity();
    image.name = "ubuntu".into();
    image.project_id = project.header.id;
    conn.images().create(&mut image).await.unwrap();

    harness
        .store
        .import_image(&image.header.id.to_string(), 4, content(b"ABCD"))
        .await
        .unwrap();

    let mut loaded = conn.images().get(image.header.id).await.unwrap();
    conn.machines()
        .image
        .change_state(&mut loaded, State::Uploading, Initiator::System)
        .unwrap();
    conn.images().update(&loaded, Initiator::System).await.unwrap();

    let mut loaded = conn.images().get(image.header.id).await.unwrap();
    conn.machines()
        .image
        .change_state(&mut loaded, State::Ready, Initiator::System)
        .unwrap();
    loaded.checksum = "cb08ca4a7bb5f9683c19133a84872ca7".into();
    conn.images().update(&loaded, Initiator::System).await.unwrap();
    conn.images().get(image.header.id).await.unwrap()
}

#[tokio::test]
async fn empty_disk_reconciles_to_ready() {
    let harness = harness().await;
    let conn = &harness.conn;
    let project = create_project(conn).await;

    let mut disk = conn.disks().new_entity();
    disk.project_id = project.header.id;
    disk.pool = "vols".into();
    disk.size = 1 << 30;
    conn.disks().create(&mut disk).await.unwrap();

    wait_for_disk_state(conn, disk.header.id, State::Ready).await;
    assert!(harness.store.disk_exists("vols", &disk.header.id.to_string()));
    assert_eq!(harness.store.disk_creates(), 1);
}

#[tokio::test]
async fn disk_from_image_is_cloned() {
    let harness = harness().await;
    let conn = &harness.conn;
    let project = create_project(conn).await;
    let image = ready_image(&harness, &project).await;

    let mut disk = conn.disks().new_entity();
    disk.project_id = project.header.id;
    disk.image_id = Some(image.header.id);
    disk.pool = "vols".into();
    disk.size = 1 << 30;
    conn.disks().create(&mut disk).await.unwrap();

    wait_for_disk_state(conn, disk.header.id, State::Ready).await;
    assert_eq!(
        harness.store.disk_size("vols", &disk.header.id.to_string()),
        Some(1 << 30)
    );
}

#[tokio::test]
async fn storage_failure_parks_disk_in_error() {
    let harness = harness().await;
    let conn = &harness.conn;
    let project = create_project(conn).await;
    harness.store.set_failing(true);

    let mut disk = conn.disks().new_entity();
    disk.project_id = project.header.id;
    disk.pool = "vols".into();
    disk.size = 1 << 30;
    conn.disks().create(&mut disk).await.unwrap();

    wait_for_disk_state(conn, disk.header.id, State::Error).await;
    assert!(!harness.store.disk_exists("vols", &disk.header.id.to_string()));
}

#[tokio::test]
async fn disk_resize_flows_through_updated() {
    let harness = harness().await;
    let conn = &harness.conn;
    let project = create_project(conn).await;

    let mut disk = conn.disks().new_entity();
    disk.project_id = project.header.id;
    disk.pool = "vols".into();
    disk.size = 1 << 30;
    conn.disks().create(&mut disk).await.unwrap();
    wait_for_disk_state(conn, disk.header.id, State::Ready).await;

    // A user resize: Ready -> Updated with the new size.
    let mut loaded = conn.disks().get(disk.header.id).await.unwrap();
    loaded.size = 2 << 30;
    conn.machines()
        .disk
        .change_state(&mut loaded, State::Updated, Initiator::User)
        .unwrap();
    conn.disks().update(&loaded, Initiator::User).await.unwrap();

    wait_for_disk_state(conn, disk.header.id, State::Ready).await;
    assert_eq!(
        harness.store.disk_size("vols", &disk.header.id.to_string()),
        Some(2 << 30)
    );
}

#[tokio::test]
async fn disk_delete_removes_bytes_and_record() {
    let harness = harness().await;
    let conn = &harness.conn;
    let project = create_project(conn).await;

    let mut disk = conn.disks().new_entity();
    disk.project_id = project.header.id;
    disk.pool = "vols".into();
    disk.size = 1 << 30;
    conn.disks().create(&mut disk).await.unwrap();
    wait_for_disk_state(conn, disk.header.id, State::Ready).await;

    conn.disks()
        .intent_delete(disk.header.id, Initiator::User)
        .await
        .unwrap();

    let disk_id = disk.header.id;
    wait_gone(|| async move { conn.disks().get(disk_id).await.is_err() }).await;
    assert!(!harness.store.disk_exists("vols", &disk_id.to_string()));

    let project = conn.projects().get(project.header.id).await.unwrap();
    assert!(project.disk_ids.is_empty());
}

#[tokio::test]
async fn image_delete_removes_bytes_and_record() {
    let harness = harness().await;
    let conn = &harness.conn;
    let project = create_project(conn).await;
    let image = ready_image(&harness, &project).await;

    conn.images()
        .intent_delete(image.header.id, Initiator::User)
        .await
        .unwrap();

    let image_id = image.header.id;
    wait_gone(|| async move { conn.images().get(image_id).await.is_err() }).await;
    assert!(harness.store.image_data(&image_id.to_string()).is_none());

    let project = conn.projects().get(project.header.id).await.unwrap();
    assert!(project.image_ids.is_empty());
}

#[tokio::test]
async fn server_lifecycle_spans_hypervisor_and_disks() {
    let harness = harness().await;
    let conn = &harness.conn;
    let project = create_project(conn).await;
    let flavor = create_flavor(conn).await;

    let mut disk = conn.disks().new_entity();
    disk.project_id = project.header.id;
    disk.pool = "vols".into();
    disk.size = 1 << 30;
    conn.disks().create(&mut disk).await.unwrap();
    wait_for_disk_state(conn, disk.header.id, State::Ready).await;

    let mut server = conn.servers().new_entity();
    server.project_id = project.header.id;
    server.flavor_id = flavor.header.id;
    server.disk_ids = vec![disk.header.id];
    server.name = "web-1".into();
    conn.servers().create(&mut server).await.unwrap();

    wait_for_server_state(conn, server.header.id, State::Ready).await;
    assert_eq!(harness.hypervisor.starts.load(Ordering::SeqCst), 1);
    assert!(harness
        .hypervisor
        .running
        .lock()
        .unwrap()
        .contains(&server.header.id));

    // Intent-delete cascades: process killed, record removed, disks freed.
    conn.servers()
        .intent_delete(server.header.id, Initiator::User)
        .await
        .unwrap();

    let server_id = server.header.id;
    wait_gone(|| async move { conn.servers().get(server_id).await.is_err() }).await;
    assert!(!harness.hypervisor.running.lock().unwrap().contains(&server_id));

    let disk = conn.disks().get(disk.header.id).await.unwrap();
    assert_eq!(disk.state(), State::Ready);
    assert_eq!(disk.server_id, None);
    let project = conn.projects().get(project.header.id).await.unwrap();
    let flavor = conn.flavors().get(flavor.header.id).await.unwrap();
    assert!(project.server_ids.is_empty());
    assert!(flavor.server_ids.is_empty());
}
