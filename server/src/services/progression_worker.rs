use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use youplace_shared::ServerMessage;

use crate::config::PROGRESSION_MAX_CONCURRENCY;
use crate::progression::{ProgressionHook, ProgressionJob};
use crate::state::AppState;

/// Calls the progression hook for each committed paint and pushes level-ups to the user's tabs.
pub async fn run(
    state: AppState,
    rx: mpsc::Receiver<ProgressionJob>,
    hook: Arc<dyn ProgressionHook>,
) {
    info!("Progression worker started (concurrency: {PROGRESSION_MAX_CONCURRENCY})");

    ReceiverStream::new(rx)
        .for_each_concurrent(PROGRESSION_MAX_CONCURRENCY, |job| {
            let state = state.clone();
            let hook = Arc::clone(&hook);
            async move {
                match hook
                    .on_pixel_accepted(&job.user_id, job.total_painted)
                    .await
                {
                    Ok(Some(level_up)) => {
                        state.observability.record_level_up();
                        info!(
                            user_id = %job.user_id,
                            new_level = level_up.new_level,
                            "user leveled up"
                        );
                        state
                            .router
                            .notify_user(&job.user_id, &ServerMessage::LevelUp(level_up));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        state.observability.record_progression_failure();
                        warn!(user_id = %job.user_id, error = %e, "progression hook failed");
                    }
                }
            }
        })
        .await;

    info!("Progression worker stopped: queue closed");
}
