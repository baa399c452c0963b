pub mod api;
pub mod sse;
pub mod ws;

use axum::http::{HeaderMap, StatusCode, header};
use tracing::warn;

use crate::identity::Identity;
use crate::state::AppState;

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Resolve a token and seed the rate ledger from the identity's balance.
///
/// `Ok(None)` for a missing or unknown token; `Err` only when the provider failed.
pub(crate) async fn authenticate(
    state: &AppState,
    token: Option<&str>,
) -> Result<Option<Identity>, StatusCode> {
    let Some(token) = token else {
        return Ok(None);
    };
    match state.identity.resolve(token).await {
        Ok(Some(identity)) => {
            let credits = identity
                .credits
                .unwrap_or(state.settings.bucket.initial_credits);
            state.ledger.seed(&identity.user_id, credits);
            Ok(Some(identity))
        }
        Ok(None) => Ok(None),
        Err(e) => {
            state.observability.record_identity_failure();
            warn!(error = %e, "identity provider failed");
            Err(StatusCode::BAD_GATEWAY)
        }
    }
}

pub(crate) async fn require_identity(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Identity, StatusCode> {
    authenticate(state, bearer_token(headers))
        .await?
        .ok_or(StatusCode::UNAUTHORIZED)
}
