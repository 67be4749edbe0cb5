use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::{
    event::NotificationEvent,
    history::HistoryByDate,
    pipeline::{IngestQueue, StatsSnapshot},
    store::HistoryStore,
};

#[derive(Clone)]
pub struct AppState {
    pub queue: IngestQueue,
    pub history: watch::Receiver<Arc<HistoryByDate>>,
    pub store: HistoryStore,
}

#[derive(Serialize)]
struct OkResponse<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Serialize)]
struct ErrResponse {
    ok: bool,
    error: &'static str,
}

fn err_response(status: StatusCode, error: &'static str) -> Response {
    (status, Json(ErrResponse { ok: false, error })).into_response()
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route("/notification", post(post_notification).options(options_ok))
        .route("/history", get(get_history))
        .route("/stats", get(get_stats))
        .with_state(state)
        .layer(cors)
}

async fn options_ok() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
struct HealthInfo {
    service: &'static str,
    version: &'static str,
    records: i64,
}

async fn health(State(state): State<AppState>) -> Response {
    match state.store.count().await {
        Ok(records) => Json(OkResponse {
            ok: true,
            data: Some(HealthInfo {
                service: "nowplaying_core",
                version: env!("CARGO_PKG_VERSION"),
                records,
            }),
        })
        .into_response(),
        Err(err) => {
            error!("count failed: {err}");
            err_response(StatusCode::INTERNAL_SERVER_ERROR, "db_error")
        }
    }
}

// Stands in for the OS notification callback: enqueue and return at once.
async fn post_notification(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    let Ok(Json(payload)) = payload else {
        return err_response(StatusCode::BAD_REQUEST, "invalid_json");
    };
    let event: NotificationEvent = match serde_json::from_value(payload) {
        Ok(v) => v,
        Err(_) => return err_response(StatusCode::BAD_REQUEST, "invalid_json"),
    };

    match state.queue.submit(event) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(OkResponse::<Value> { ok: true, data: None }),
        )
            .into_response(),
        Err(err) => err_response(StatusCode::SERVICE_UNAVAILABLE, err.code()),
    }
}

async fn get_history(State(state): State<AppState>) -> Response {
    let snapshot = state.history.borrow().clone();
    Json(OkResponse {
        ok: true,
        data: Some(snapshot.as_ref().clone()),
    })
    .into_response()
}

async fn get_stats(State(state): State<AppState>) -> Json<OkResponse<StatsSnapshot>> {
    Json(OkResponse {
        ok: true,
        data: Some(state.queue.stats()),
    })
}
