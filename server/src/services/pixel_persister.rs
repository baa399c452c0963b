use tokio::sync::mpsc;
use tracing::{info, warn};
use youplace_shared::Pixel;

use crate::config::PERSIST_BATCH_SIZE;
use crate::state::AppState;

/// Drains the authority's persist queue into the store in batches.
///
/// Storage is best-effort: a failed batch is logged and counted, never retried
/// against the live canvas.
pub async fn run(state: AppState, mut rx: mpsc::Receiver<Pixel>) {
    info!("Pixel persister started (batch size: {PERSIST_BATCH_SIZE})");
    let mut batch = Vec::with_capacity(PERSIST_BATCH_SIZE);

    while let Some(first) = rx.recv().await {
        batch.push(first);
        while batch.len() < PERSIST_BATCH_SIZE {
            match rx.try_recv() {
                Ok(pixel) => batch.push(pixel),
                Err(_) => break,
            }
        }

        persist_batch(&state, &batch).await;
        batch.clear();
    }

    info!("Pixel persister stopped: queue closed");
}

async fn persist_batch(state: &AppState, batch: &[Pixel]) {
    match state.store.persist(batch).await {
        Ok(written) => state.observability.record_persisted_pixels(written),
        Err(e) => {
            state.observability.record_persist_failure();
            warn!(error = %e, pixels = batch.len(), "failed to persist pixel batch");
        }
    }
}
