use tracing::{debug, info};
use youplace_shared::ServerMessage;

use crate::state::AppState;

/// Pushes `rate_status` to connected users whose bucket is still refilling.
pub async fn run(state: AppState) {
    let period = state.settings.rate_status_interval;
    info!("Rate status broadcaster started (interval: {}s)", period.as_secs());
    let mut interval = tokio::time::interval(period);

    loop {
        interval.tick().await;
        let notified = broadcast_once(&state);
        if notified > 0 {
            debug!(notified, "pushed rate status to refilling users");
        }
    }
}

pub(crate) fn broadcast_once(state: &AppState) -> usize {
    let mut notified = 0;
    for user_id in state.router.connected_users() {
        let status = state.ledger.status(&user_id);
        if status.tokens >= status.max_tokens {
            continue;
        }
        if state
            .router
            .notify_user(&user_id, &ServerMessage::RateStatus(status))
            > 0
        {
            notified += 1;
        }
    }
    notified
}
