//! Image reconciliation hooks.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use minicloud_ceph::BlockStore;
use minicloud_core::{retry, ImageId, Initiator, State};
use minicloud_db::model::Record;
use minicloud_db::{Connection, Hook};

async fn set_image_state(
    shutdown: &CancellationToken,
    conn: &Connection,
    id: ImageId,
    state: State,
) {
    let result = retry(shutdown, || async move {
        let mut image = conn.images().get(id).await?;
        conn.machines()
            .image
            .change_state(&mut image, state, Initiator::System)?;
        conn.images().update(&image, Initiator::System).await
    })
    .await;
    if let Err(e) = result {
        tracing::error!(image_id = %id, state = %state, error = %e, "failed to change image state");
    }
}

/// `Deleting` hook: remove the image bytes, then the record.
pub struct ImageDeleting {
    store: Arc<dyn BlockStore>,
}

impl ImageDeleting {
    /// Creates the hook.
    #[must_use]
    pub fn new(store: Arc<dyn BlockStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Hook for ImageDeleting {
    async fn run(&self, shutdown: CancellationToken, conn: &Connection, record: Record) {
        let Record::Image(image) = record else { return };
        let id = image.header.id;
        let name = id.to_string();
        if let Err(e) = self.store.delete_image(&name).await {
            tracing::warn!(image_id = %id, error = %e, "image removal failed");
            set_image_state(&shutdown, conn, id, State::Error).await;
            return;
        }
        let result = retry(&shutdown, || async move {
            conn.images().delete(id, Initiator::System).await
        })
        .await;
        if let Err(e) = result {
            tracing::error!(image_id = %id, error = %e, "failed to delete image record");
        }
    }
}
