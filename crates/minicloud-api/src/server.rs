//! Router assembly and the HTTP server loop.

use std::sync::Arc;

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::Instrument;
use ulid::Ulid;

use minicloud_ceph::BlockStore;
use minicloud_core::observability::request_span;
use minicloud_core::Result;
use minicloud_db::Connection;

use crate::routes;

/// Shared state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The control-plane connection.
    pub conn: Arc<Connection>,
    /// The block-storage driver (image uploads).
    pub store: Arc<dyn BlockStore>,
    /// Cancelled at process shutdown; bounds handler-side retries.
    pub shutdown: CancellationToken,
}

/// Tags every request with a fresh request ID span.
async fn request_context(request: Request, next: Next) -> Response {
    let request_id = Ulid::new().to_string();
    let span = request_span(
        &request_id,
        request.method().as_str(),
        request.uri().path(),
    );
    next.run(request).instrument(span).await
}

/// Builds the full HTTP surface.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/projects", routes::projects::routes())
        .nest("/images", routes::images::routes())
        .nest("/disks", routes::disks::routes())
        .nest("/flavors", routes::flavors::routes())
        .nest("/servers", routes::servers::routes())
        .layer(middleware::from_fn(request_context))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the API until `shutdown` fires.
///
/// # Errors
///
/// Returns a backend error when binding or serving fails.
pub async fn serve(
    state: AppState,
    addr: std::net::SocketAddr,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| minicloud_core::Error::backend(format!("failed to bind {addr}: {e}")))?;
    tracing::info!(%addr, "serving api");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| minicloud_core::Error::backend(format!("server failed: {e}")))
}
