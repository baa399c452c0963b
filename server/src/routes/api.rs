use std::fmt::Write as _;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Deserialize;
use tracing::warn;
use youplace_shared::{
    AreaSnapshot, Cell, PaintRequest, PixelHistory, PixelInfo, RejectReason, UserStats, Viewport,
};

use crate::authority::PaintOutcome;
use crate::config::DEFAULT_HISTORY_LIMIT;
use crate::routes::require_identity;
use crate::state::{AppState, ObservabilitySnapshot};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaQuery {
    pub min_x: i32,
    pub max_x: i32,
    pub min_y: i32,
    pub max_y: i32,
}

impl AreaQuery {
    pub fn viewport(self) -> Viewport {
        Viewport::new(self.min_x, self.max_x, self.min_y, self.max_y)
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": code, "message": message.into() })),
    )
        .into_response()
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let observability = state.observability.snapshot();
    Json(serde_json::json!({
        "status": "ok",
        "live_pixels": state.authority.live_count(),
        "seq": state.authority.current_seq(),
        "connected_clients": state.router.client_count(),
        "active_rooms": state.router.active_rooms(),
        "conflict_policy": state.authority.policy().as_str(),
        "uptime_secs": (Utc::now() - state.started_at).num_seconds().max(0),
        "observability": {
            "paints_accepted_total": observability.paints_accepted_total,
            "dropped_broadcasts_total": observability.dropped_broadcasts_total,
            "persist_failures_total": observability.persist_failures_total,
            "progression_failures_total": observability.progression_failures_total,
        }
    }))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let gauges = MetricGauges {
        live_pixels: state.authority.live_count(),
        connected_clients: state.router.client_count(),
        connected_users: state.router.connected_users().len(),
        active_rooms: state.router.active_rooms(),
        rate_tracked_users: state.ledger.tracked_users(),
        seq: state.authority.current_seq(),
    };
    let body = render_prometheus_metrics(gauges, state.observability.snapshot());

    (
        [
            (header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-store"),
        ],
        body,
    )
}

#[derive(Debug, Clone, Copy)]
struct MetricGauges {
    live_pixels: usize,
    connected_clients: usize,
    connected_users: usize,
    active_rooms: usize,
    rate_tracked_users: usize,
    seq: u64,
}

fn write_metric(body: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    let _ = writeln!(body, "# HELP {name} {help}");
    let _ = writeln!(body, "# TYPE {name} {kind}");
    let _ = writeln!(body, "{name} {value}");
}

fn render_prometheus_metrics(gauges: MetricGauges, observability: ObservabilitySnapshot) -> String {
    let mut body = String::new();
    write_metric(
        &mut body,
        "youplace_live_pixels",
        "gauge",
        "Painted cells on the live canvas.",
        gauges.live_pixels as u64,
    );
    write_metric(
        &mut body,
        "youplace_connected_clients",
        "gauge",
        "Open live connections (WebSocket and SSE).",
        gauges.connected_clients as u64,
    );
    write_metric(
        &mut body,
        "youplace_connected_users",
        "gauge",
        "Distinct authenticated users with at least one open connection.",
        gauges.connected_users as u64,
    );
    write_metric(
        &mut body,
        "youplace_active_rooms",
        "gauge",
        "Rooms with at least one subscriber.",
        gauges.active_rooms as u64,
    );
    write_metric(
        &mut body,
        "youplace_rate_tracked_users",
        "gauge",
        "Users with rate-limit state in memory.",
        gauges.rate_tracked_users as u64,
    );
    write_metric(
        &mut body,
        "youplace_commit_seq",
        "gauge",
        "Sequence number of the latest committed paint.",
        gauges.seq,
    );
    write_metric(
        &mut body,
        "youplace_paints_accepted_total",
        "counter",
        "Paints committed to the canvas.",
        observability.paints_accepted_total,
    );
    write_metric(
        &mut body,
        "youplace_paints_superseded_total",
        "counter",
        "Paints accepted but superseded by a newer pixel.",
        observability.paints_superseded_total,
    );

    let _ = writeln!(
        body,
        "# HELP youplace_paints_rejected_total Paints rejected, by reason."
    );
    let _ = writeln!(body, "# TYPE youplace_paints_rejected_total counter");
    for (reason, value) in [
        ("InvalidColor", observability.paints_rejected_invalid_color_total),
        ("CooldownActive", observability.paints_rejected_cooldown_total),
        ("InsufficientCredits", observability.paints_rejected_credits_total),
        ("OutOfRange", observability.paints_rejected_out_of_range_total),
    ] {
        let _ = writeln!(
            body,
            "youplace_paints_rejected_total{{reason=\"{reason}\"}} {value}"
        );
    }

    write_metric(
        &mut body,
        "youplace_dropped_broadcasts_total",
        "counter",
        "Broadcast events dropped because a connection's queue was full.",
        observability.dropped_broadcasts_total,
    );
    write_metric(
        &mut body,
        "youplace_resyncs_total",
        "counter",
        "Snapshots sent to lagged connections.",
        observability.resyncs_total,
    );
    write_metric(
        &mut body,
        "youplace_persisted_pixels_total",
        "counter",
        "Pixels written to the store.",
        observability.persisted_pixels_total,
    );
    write_metric(
        &mut body,
        "youplace_persist_failures_total",
        "counter",
        "Failed store batches.",
        observability.persist_failures_total,
    );
    write_metric(
        &mut body,
        "youplace_persist_queue_drops_total",
        "counter",
        "Pixels never queued for storage.",
        observability.persist_queue_drops_total,
    );
    write_metric(
        &mut body,
        "youplace_progression_failures_total",
        "counter",
        "Progression hook calls that failed or were skipped.",
        observability.progression_failures_total,
    );
    write_metric(
        &mut body,
        "youplace_level_ups_total",
        "counter",
        "Level-ups pushed to users.",
        observability.level_ups_total,
    );
    write_metric(
        &mut body,
        "youplace_identity_failures_total",
        "counter",
        "Identity provider errors.",
        observability.identity_failures_total,
    );
    write_metric(
        &mut body,
        "youplace_ws_connections_total",
        "counter",
        "WebSocket connections accepted.",
        observability.ws_connections_total,
    );
    write_metric(
        &mut body,
        "youplace_sse_connections_total",
        "counter",
        "SSE spectator streams opened.",
        observability.sse_connections_total,
    );

    body
}

pub async fn paint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PaintRequest>,
) -> Result<Response, StatusCode> {
    let identity = require_identity(&state, &headers).await?;
    let outcome = state
        .authority
        .submit_paint(&identity, request.cell, &request.color);
    Ok(paint_response(&outcome))
}

fn paint_response(outcome: &PaintOutcome) -> Response {
    let status = match outcome {
        PaintOutcome::Accepted { .. } | PaintOutcome::Superseded { .. } => StatusCode::OK,
        PaintOutcome::Rejected(RejectReason::InvalidColor | RejectReason::OutOfRange) => {
            StatusCode::BAD_REQUEST
        }
        PaintOutcome::Rejected(RejectReason::CooldownActive { .. }) => {
            StatusCode::TOO_MANY_REQUESTS
        }
        PaintOutcome::Rejected(RejectReason::InsufficientCredits) => StatusCode::FORBIDDEN,
        PaintOutcome::Rejected(RejectReason::Timeout) => StatusCode::GATEWAY_TIMEOUT,
    };
    let mut response = (status, Json(outcome.ack())).into_response();
    if let PaintOutcome::Rejected(RejectReason::CooldownActive { seconds_remaining }) = outcome
        && let Ok(value) = HeaderValue::from_str(&seconds_remaining.to_string())
    {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

pub async fn get_area(
    State(state): State<AppState>,
    Query(query): Query<AreaQuery>,
) -> Result<Json<AreaSnapshot>, Response> {
    let viewport = query.viewport();
    if viewport.area() > state.settings.max_snapshot_area {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "area_too_large",
            format!(
                "area spans {} cells (max {})",
                viewport.area(),
                state.settings.max_snapshot_area
            ),
        ));
    }
    let Some(viewport) = state.codec.clamp_viewport(viewport) else {
        return Ok(Json(AreaSnapshot {
            pixels: Vec::new(),
            count: 0,
            truncated: false,
        }));
    };
    Ok(Json(
        state
            .authority
            .snapshot_rect(viewport, state.settings.max_snapshot_pixels),
    ))
}

pub async fn get_pixel(
    State(state): State<AppState>,
    Path((x, y)): Path<(i32, i32)>,
) -> Result<Json<PixelInfo>, Response> {
    let cell = Cell::new(x, y);
    if !state.codec.contains(cell) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            RejectReason::OutOfRange.code(),
            RejectReason::OutOfRange.to_string(),
        ));
    }
    Ok(Json(PixelInfo {
        pixel: state.authority.pixel_at(cell),
    }))
}

pub async fn get_pixel_history(
    State(state): State<AppState>,
    Path((x, y)): Path<(i32, i32)>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<PixelHistory>, Response> {
    let cell = Cell::new(x, y);
    if !state.codec.contains(cell) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            RejectReason::OutOfRange.code(),
            RejectReason::OutOfRange.to_string(),
        ));
    }
    let limit = query
        .limit
        .filter(|limit| *limit > 0)
        .unwrap_or(DEFAULT_HISTORY_LIMIT);
    match state.store.history(cell, limit).await {
        Ok(history) => Ok(Json(PixelHistory { cell, history })),
        Err(e) => {
            warn!(error = %e, %cell, "failed to load pixel history");
            Err(api_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "history_unavailable",
                "pixel history is temporarily unavailable",
            ))
        }
    }
}

pub async fn get_credits(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    let identity = require_identity(&state, &headers).await?;
    Ok((
        [(header::CACHE_CONTROL, "no-store")],
        Json(state.ledger.status(&identity.user_id)),
    ))
}

pub async fn get_user_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UserStats>, StatusCode> {
    let identity = require_identity(&state, &headers).await?;
    Ok(Json(UserStats {
        pixel_count: state.authority.painted_count(&identity.user_id),
        user_id: identity.user_id,
    }))
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use serde_json::{Value, json};
    use youplace_shared::{AreaSnapshot, PaintAck, PixelHistory, PixelInfo, RateStatus, UserStats};

    use super::{MetricGauges, render_prometheus_metrics};
    use crate::config::Settings;
    use crate::ledger::BucketConfig;
    use crate::state::test_support::test_state;
    use crate::state::{AppState, ObservabilitySnapshot};

    async fn spawn_test_server(state: AppState) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener address");
        let app = crate::app::build_app(state);
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve test app");
        });
        (addr, handle)
    }

    fn settings_with_credits(credits: u64) -> Settings {
        Settings {
            bucket: BucketConfig {
                initial_credits: credits,
                ..BucketConfig::default()
            },
            ..Settings::default()
        }
    }

    #[test]
    fn metrics_output_contains_prometheus_help_type_and_values() {
        let observability = ObservabilitySnapshot {
            paints_accepted_total: 12,
            paints_superseded_total: 1,
            paints_rejected_invalid_color_total: 2,
            paints_rejected_cooldown_total: 3,
            paints_rejected_credits_total: 4,
            paints_rejected_out_of_range_total: 5,
            dropped_broadcasts_total: 7,
            resyncs_total: 6,
            persisted_pixels_total: 99,
            persist_failures_total: 3,
            persist_queue_drops_total: 0,
            progression_failures_total: 8,
            level_ups_total: 2,
            identity_failures_total: 1,
            ws_connections_total: 40,
            sse_connections_total: 9,
        };
        let gauges = MetricGauges {
            live_pixels: 42,
            connected_clients: 5,
            connected_users: 3,
            active_rooms: 11,
            rate_tracked_users: 17,
            seq: 120,
        };

        let metrics = render_prometheus_metrics(gauges, observability);

        assert!(metrics.contains("# HELP youplace_live_pixels"));
        assert!(metrics.contains("# TYPE youplace_paints_accepted_total counter"));
        assert!(metrics.contains("youplace_live_pixels 42"));
        assert!(metrics.contains("youplace_connected_clients 5"));
        assert!(metrics.contains("youplace_commit_seq 120"));
        assert!(metrics.contains("youplace_paints_accepted_total 12"));
        assert!(metrics.contains("youplace_paints_rejected_total{reason=\"CooldownActive\"} 3"));
        assert!(metrics.contains("youplace_paints_rejected_total{reason=\"OutOfRange\"} 5"));
        assert!(metrics.contains("youplace_dropped_broadcasts_total 7"));
        assert!(metrics.contains("youplace_persisted_pixels_total 99"));
        assert!(metrics.contains("youplace_sse_connections_total 9"));
    }

    #[tokio::test]
    async fn paint_flow_over_rest_reports_reasons_and_statuses() {
        let (state, _queues) = test_state(settings_with_credits(2));
        let (addr, server_handle) = spawn_test_server(state).await;
        let base_url = format!("http://{addr}");
        let client = reqwest::Client::new();

        let unauthorized = client
            .post(format!("{base_url}/api/pixels/paint"))
            .json(&json!({ "cell": { "x": 5, "y": 5 }, "color": "#FF0000" }))
            .send()
            .await
            .expect("paint request");
        assert_eq!(unauthorized.status(), reqwest::StatusCode::UNAUTHORIZED);

        for color in ["#FF0000", "00ff00"] {
            let response = client
                .post(format!("{base_url}/api/pixels/paint"))
                .bearer_auth("alice-token")
                .json(&json!({ "cell": { "x": 5, "y": 5 }, "color": color }))
                .send()
                .await
                .expect("paint request");
            assert_eq!(response.status(), reqwest::StatusCode::OK);
            let ack: PaintAck = response.json().await.expect("ack json");
            assert!(ack.accepted);
            assert_eq!(
                ack.pixel.as_ref().map(|p| p.painter_name.clone()),
                Some(Some("Alice".to_owned()))
            );
        }

        let exhausted = client
            .post(format!("{base_url}/api/pixels/paint"))
            .bearer_auth("alice-token")
            .json(&json!({ "cell": { "x": 5, "y": 5 }, "color": "#0000FF" }))
            .send()
            .await
            .expect("paint request");
        assert_eq!(exhausted.status(), reqwest::StatusCode::FORBIDDEN);
        let body: Value = exhausted.json().await.expect("ack json");
        assert_eq!(body["accepted"], false);
        assert_eq!(body["reason"]["code"], "InsufficientCredits");

        let invalid = client
            .post(format!("{base_url}/api/pixels/paint"))
            .bearer_auth("bob-token")
            .json(&json!({ "cell": { "x": 5, "y": 5 }, "color": "#GG0000" }))
            .send()
            .await
            .expect("paint request");
        assert_eq!(invalid.status(), reqwest::StatusCode::BAD_REQUEST);

        let info: PixelInfo = client
            .get(format!("{base_url}/api/pixels/5/5"))
            .send()
            .await
            .expect("pixel request")
            .json()
            .await
            .expect("pixel json");
        let pixel = info.pixel.expect("cell is painted");
        assert_eq!(pixel.color.as_str(), "#00FF00");
        assert_eq!(pixel.painted_by, "alice");

        let credits: RateStatus = client
            .get(format!("{base_url}/api/credits"))
            .bearer_auth("alice-token")
            .send()
            .await
            .expect("credits request")
            .json()
            .await
            .expect("credits json");
        assert_eq!(credits.credits, 0);
        assert_eq!(credits.tokens, 8);

        let stats: UserStats = client
            .get(format!("{base_url}/api/user/stats"))
            .bearer_auth("alice-token")
            .send()
            .await
            .expect("stats request")
            .json()
            .await
            .expect("stats json");
        assert_eq!(stats.pixel_count, 2);

        server_handle.abort();
        let _ = server_handle.await;
    }

    #[tokio::test]
    async fn empty_bucket_answers_429_with_retry_after() {
        let settings = Settings {
            bucket: BucketConfig {
                capacity: 1,
                ..BucketConfig::default()
            },
            ..Settings::default()
        };
        let (state, _queues) = test_state(settings);
        let (addr, server_handle) = spawn_test_server(state).await;
        let client = reqwest::Client::new();
        let url = format!("http://{addr}/api/pixels/paint");

        let first = client
            .post(&url)
            .bearer_auth("bob-token")
            .json(&json!({ "cell": { "x": 1, "y": 1 }, "color": "#123456" }))
            .send()
            .await
            .expect("paint request");
        assert_eq!(first.status(), reqwest::StatusCode::OK);

        let second = client
            .post(&url)
            .bearer_auth("bob-token")
            .json(&json!({ "cell": { "x": 1, "y": 1 }, "color": "#123456" }))
            .send()
            .await
            .expect("paint request");
        assert_eq!(second.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = second
            .headers()
            .get("retry-after")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .expect("retry-after header");
        assert!((1..=30).contains(&retry_after));

        server_handle.abort();
        let _ = server_handle.await;
    }

    #[tokio::test]
    async fn area_snapshot_is_bounded_and_clamped() {
        let (state, _queues) = test_state(Settings {
            max_snapshot_area: 10_000,
            ..Settings::default()
        });
        let alice = crate::identity::Identity::new("alice");
        state
            .authority
            .submit_paint(&alice, youplace_shared::Cell::new(0, 0), "#111111");
        state
            .authority
            .submit_paint(&alice, youplace_shared::Cell::new(50, 50), "#222222");
        let (addr, server_handle) = spawn_test_server(state).await;
        let base_url = format!("http://{addr}");
        let client = reqwest::Client::new();

        let snapshot: AreaSnapshot = client
            .get(format!("{base_url}/api/pixels/area?minX=-20&maxX=20&minY=-20&maxY=20"))
            .send()
            .await
            .expect("area request")
            .json()
            .await
            .expect("area json");
        assert_eq!(snapshot.count, 1);
        assert_eq!(snapshot.pixels[0].color.as_str(), "#111111");

        let too_large = client
            .get(format!("{base_url}/api/pixels/area?minX=0&maxX=1000&minY=0&maxY=1000"))
            .send()
            .await
            .expect("area request");
        assert_eq!(too_large.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: Value = too_large.json().await.expect("error json");
        assert_eq!(body["error"], "area_too_large");

        let off_grid: AreaSnapshot = client
            .get(format!("{base_url}/api/pixels/area?minX=-50&maxX=-10&minY=0&maxY=10"))
            .send()
            .await
            .expect("area request")
            .json()
            .await
            .expect("area json");
        assert_eq!(off_grid.count, 0);

        let out_of_range = client
            .get(format!("{base_url}/api/pixels/-1/0"))
            .send()
            .await
            .expect("pixel request");
        assert_eq!(out_of_range.status(), reqwest::StatusCode::BAD_REQUEST);

        server_handle.abort();
        let _ = server_handle.await;
    }

    #[tokio::test]
    async fn history_reads_from_the_store_after_persisting() {
        let (state, queues) = test_state(Settings::default());
        let persister = tokio::spawn(crate::services::pixel_persister::run(
            state.clone(),
            queues.persist_rx,
        ));
        let (addr, server_handle) = spawn_test_server(state.clone()).await;
        let base_url = format!("http://{addr}");
        let client = reqwest::Client::new();

        for color in ["#000001", "#000002", "#000003"] {
            client
                .post(format!("{base_url}/api/pixels/paint"))
                .bearer_auth("bob-token")
                .json(&json!({ "cell": { "x": 9, "y": 9 }, "color": color }))
                .send()
                .await
                .expect("paint request")
                .error_for_status()
                .expect("paint status");
        }

        let mut history = PixelHistory {
            cell: youplace_shared::Cell::new(9, 9),
            history: Vec::new(),
        };
        for _ in 0..50 {
            history = client
                .get(format!("{base_url}/api/pixels/9/9/history?limit=2"))
                .send()
                .await
                .expect("history request")
                .json()
                .await
                .expect("history json");
            if history.history.len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(
            history
                .history
                .iter()
                .map(|p| p.color.as_str().to_owned())
                .collect::<Vec<_>>(),
            vec!["#000003".to_owned(), "#000002".to_owned()]
        );

        server_handle.abort();
        let _ = server_handle.await;
        persister.abort();
    }

    #[tokio::test]
    async fn health_and_metrics_expose_expected_contract() {
        let (state, _queues) = test_state(Settings::default());
        let (addr, server_handle) = spawn_test_server(state).await;
        let base_url = format!("http://{addr}");
        let client = reqwest::Client::new();

        let health: Value = client
            .get(format!("{base_url}/api/health"))
            .send()
            .await
            .expect("health request")
            .json()
            .await
            .expect("health json");
        assert_eq!(health["status"], "ok");
        assert_eq!(health["conflict_policy"], "arrival");
        assert_eq!(health["live_pixels"], 0);

        let metrics = client
            .get(format!("{base_url}/api/metrics"))
            .send()
            .await
            .expect("metrics request");
        let content_type = metrics
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .expect("content type");
        assert!(content_type.starts_with("text/plain; version=0.0.4"));
        let body = metrics.text().await.expect("metrics body");
        assert!(body.contains("youplace_live_pixels 0"));

        server_handle.abort();
        let _ = server_handle.await;
    }
}
