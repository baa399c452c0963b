use axum::Router;
use axum::routing::{get, post};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;

use crate::routes;
use crate::state::AppState;

pub(crate) fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/api/pixels/paint", post(routes::api::paint))
        .route("/api/pixels/area", get(routes::api::get_area))
        .route("/api/pixels/{x}/{y}", get(routes::api::get_pixel))
        .route(
            "/api/pixels/{x}/{y}/history",
            get(routes::api::get_pixel_history),
        )
        .route("/api/credits", get(routes::api::get_credits))
        .route("/api/user/stats", get(routes::api::get_user_stats))
        .route("/api/ws", get(routes::ws::ws_handler))
        .route("/api/events", get(routes::sse::pixel_events))
        .route("/api/health", get(routes::api::health))
        .route("/api/metrics", get(routes::api::metrics))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    use super::build_app;
    use crate::config::Settings;
    use crate::state::test_support::test_state;

    #[tokio::test]
    async fn unknown_routes_are_not_found() {
        let (state, _queues) = test_state(Settings::default());
        let response = build_app(state)
            .oneshot(
                Request::builder()
                    .uri("/api/territories")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cors_preflight_is_answered() {
        let (state, _queues) = test_state(Settings::default());
        let response = build_app(state)
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/pixels/paint")
                    .header(header::ORIGIN, "https://map.example")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert!(response.status().is_success());
        assert!(
            response
                .headers()
                .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        );
    }

    #[tokio::test]
    async fn credits_require_a_token() {
        let (state, _queues) = test_state(Settings::default());
        let response = build_app(state)
            .oneshot(
                Request::builder()
                    .uri("/api/credits")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
