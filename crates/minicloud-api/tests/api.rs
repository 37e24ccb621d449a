//! HTTP-level integration tests over the in-memory backend and drivers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::CONTENT_LENGTH;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use minicloud_api::server::AppState;
use minicloud_ceph::MemoryBlockStore;
use minicloud_core::{Result, ServerId, State};
use minicloud_db::memory::MemoryCluster;
use minicloud_db::{watch_notifications, Connection};
use minicloud_qemu::{Hypervisor, VmSpec};
use minicloud_reconciler::machines;

#[derive(Default)]
struct FakeHypervisor {
    running: Mutex<HashSet<ServerId>>,
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn start(&self, spec: VmSpec) -> Result<()> {
        self.running.lock().unwrap().insert(spec.id);
        Ok(())
    }

    async fn stop(&self, id: ServerId) -> Result<()> {
        self.running.lock().unwrap().remove(&id);
        Ok(())
    }
}

struct Api {
    app: Router,
    conn: Arc<Connection>,
    store: Arc<MemoryBlockStore>,
    shutdown: CancellationToken,
}

impl Drop for Api {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn api() -> Api {
    let cluster = MemoryCluster::new();
    let store = Arc::new(MemoryBlockStore::new());
    let hypervisor = Arc::new(FakeHypervisor::default());
    let conn = Arc::new(Connection::new(
        Arc::new(cluster.connect()),
        Arc::new(machines(store.clone(), hypervisor)),
    ));
    let shutdown = CancellationToken::new();
    watch_notifications(shutdown.clone(), conn.clone())
        .await
        .unwrap();
    let app = minicloud_api::router(AppState {
        conn: conn.clone(),
        store: store.clone(),
        shutdown: shutdown.clone(),
    });
    Api {
        app,
        conn,
        store,
        shutdown,
    }
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn put_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Creates an entity and returns its ID from the response header.
async fn create_entity(api: &Api, collection: &str, body: Value) -> String {
    let response = api
        .app
        .clone()
        .oneshot(post(&format!("/{collection}"), body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    response
        .headers()
        .get("x-entity-id")
        .expect("X-Entity-Id header")
        .to_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn project_create_fetch_and_duplicate() {
    let api = api().await;

    let id = create_entity(&api, "projects", json!({"Name": "alpha"})).await;

    let response = api
        .app
        .clone()
        .oneshot(get(&format!("/projects/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["Id"], id);
    assert_eq!(body["Name"], "alpha");
    assert_eq!(body["ImageIds"], json!([]));

    // Same name again: the uniqueness claim rejects the transaction.
    let response = api
        .app
        .clone()
        .oneshot(post("/projects", json!({"Name": "alpha"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert!(body["Xid"].is_string());
}

#[tokio::test]
async fn validation_failure_names_the_field() {
    let api = api().await;

    let response = api
        .app
        .clone()
        .oneshot(post("/projects", json!({"Name": "a"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["Entity"], "project");
    assert_eq!(body["Field"], "Name");
    assert!(body["Message"].is_string());
}

#[tokio::test]
async fn ill_formed_ulid_is_not_found_not_method_error() {
    let api = api().await;

    let response = api
        .app
        .clone()
        .oneshot(get("/projects/not-a-ulid"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unconfigured_method_is_405_with_allow() {
    let api = api().await;

    let response = api
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri("/projects")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    let allow = response.headers().get("allow").expect("Allow header");
    let allow = allow.to_str().unwrap();
    assert!(allow.contains("GET"));
    assert!(allow.contains("POST"));
}

#[tokio::test]
async fn missing_project_is_404_with_body() {
    let api = api().await;

    let ghost = minicloud_core::ProjectId::generate();
    let response = api
        .app
        .clone()
        .oneshot(get(&format!("/projects/{ghost}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["Entity"], "project");
    assert_eq!(body["Id"], ghost.to_string());
}

#[tokio::test]
async fn image_upload_sets_checksum_and_ready() {
    let api = api().await;

    let project = create_entity(&api, "projects", json!({"Name": "alpha"})).await;
    let image = create_entity(
        &api,
        "images",
        json!({"Name": "ubuntu", "ProjectId": project}),
    )
    .await;

    // Without Content-Length the upload is refused outright.
    let response = api
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/images/{image}/contents"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::LENGTH_REQUIRED);

    let response = api
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/images/{image}/contents"))
                .header(CONTENT_LENGTH, 4)
                .body(Body::from("ABCD"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = api
        .app
        .clone()
        .oneshot(get(&format!("/images/{image}")))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["State"], "Ready");
    assert_eq!(body["Checksum"], "cb08ca4a7bb5f9683c19133a84872ca7");
    assert_eq!(api.store.image_data(&image).unwrap(), b"ABCD");
}

#[tokio::test]
async fn disk_from_image_reconciles_to_ready() {
    let api = api().await;

    let project = create_entity(&api, "projects", json!({"Name": "alpha"})).await;
    let image = create_entity(
        &api,
        "images",
        json!({"Name": "ubuntu", "ProjectId": project}),
    )
    .await;
    let response = api
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/images/{image}/contents"))
                .header(CONTENT_LENGTH, 4)
                .body(Body::from("ABCD"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let disk = create_entity(
        &api,
        "disks",
        json!({
            "ProjectId": project,
            "ImageId": image,
            "Pool": "vols",
            "Size": 1_073_741_824u64,
        }),
    )
    .await;

    // The Created hook clones the image and moves the disk to Ready.
    let mut state = String::new();
    for _ in 0..300 {
        let response = api
            .app
            .clone()
            .oneshot(get(&format!("/disks/{disk}")))
            .await
            .unwrap();
        let body = body_json(response).await;
        state = body["State"].as_str().unwrap_or_default().to_string();
        if state == "Ready" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, "Ready");
    assert_eq!(api.store.disk_size("vols", &disk), Some(1_073_741_824));

    // The notification key for (disk, Created) is gone from the meta tree.
    let disk_id: minicloud_core::DiskId = disk.parse().unwrap();
    let notify = minicloud_db::keys::notify_key(
        minicloud_core::EntityKind::Disk,
        &disk_id.to_string(),
        State::Created,
    );
    assert!(api.conn.backend().read(&notify).await.unwrap().is_absent());
}

#[tokio::test]
async fn rename_conflicts_surface_as_409() {
    let api = api().await;

    let id = create_entity(&api, "projects", json!({"Name": "alpha"})).await;
    create_entity(&api, "projects", json!({"Name": "beta"})).await;

    // Renaming onto a claimed name loses against the existing claim.
    let response = api
        .app
        .clone()
        .oneshot(put_json(&format!("/projects/{id}"), json!({"Name": "beta"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // A clean rename succeeds and the record reflects it.
    let response = api
        .app
        .clone()
        .oneshot(put_json(&format!("/projects/{id}"), json!({"Name": "gamma"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = api
        .app
        .clone()
        .oneshot(get(&format!("/projects/{id}")))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["Name"], "gamma");
}

#[tokio::test]
async fn server_delete_cascades() {
    let api = api().await;

    let project = create_entity(&api, "projects", json!({"Name": "alpha"})).await;
    let flavor = create_entity(
        &api,
        "flavors",
        json!({"Name": "small", "NumCPUs": 2, "RAM": 2048}),
    )
    .await;
    let disk = create_entity(
        &api,
        "disks",
        json!({"ProjectId": project, "Pool": "vols", "Size": 1_073_741_824u64}),
    )
    .await;

    // Wait for the disk to become attachable.
    for _ in 0..300 {
        let response = api
            .app
            .clone()
            .oneshot(get(&format!("/disks/{disk}")))
            .await
            .unwrap();
        if body_json(response).await["State"] == "Ready" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let server = create_entity(
        &api,
        "servers",
        json!({
            "ProjectId": project,
            "FlavorId": flavor,
            "DiskIds": [disk],
            "Name": "web-1",
        }),
    )
    .await;

    for _ in 0..300 {
        let response = api
            .app
            .clone()
            .oneshot(get(&format!("/servers/{server}")))
            .await
            .unwrap();
        if body_json(response).await["State"] == "Ready" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let response = api
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/servers/{server}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // The Deleting hook removes the record and frees the disk.
    for _ in 0..300 {
        let response = api
            .app
            .clone()
            .oneshot(get(&format!("/servers/{server}")))
            .await
            .unwrap();
        if response.status() == StatusCode::NOT_FOUND {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let response = api
        .app
        .clone()
        .oneshot(get(&format!("/disks/{disk}")))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["State"], "Ready");
    assert_eq!(body["ServerId"], Value::Null);

    let response = api
        .app
        .clone()
        .oneshot(get(&format!("/projects/{project}")))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["ServerIds"], json!([]));
}
