//! Local HTTP surface for the browser shim (triggers) and the popup (stats, categories).

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tracing::{error, warn};

use crate::{
    category::Category,
    controller::{ControllerHandle, Trigger},
    error::CategoryError,
    sync::SyncEngine,
};

#[derive(Clone)]
pub struct AppState {
    pub controller: ControllerHandle,
    pub sync: Option<Arc<SyncEngine>>,
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

#[derive(Deserialize)]
struct CategoryUpdate {
    domain: String,
    category: String,
}

#[derive(Serialize)]
struct HealthInfo {
    service: &'static str,
    version: &'static str,
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(OkResponse {
        ok: true,
        data: Some(data),
    })
    .into_response()
}

fn ok_empty() -> Response {
    Json(OkResponse::<Value> {
        ok: true,
        data: None,
    })
    .into_response()
}

fn fail(status: StatusCode, error: &'static str) -> Response {
    (status, Json(ErrResponse { ok: false, error })).into_response()
}

fn controller_gone() -> Response {
    error!("controller queue closed");
    fail(StatusCode::SERVICE_UNAVAILABLE, "controller_unavailable")
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route("/event", post(post_event).options(options_ok))
        .route("/stats", get(get_stats))
        .route("/clear", post(post_clear).options(options_ok))
        .route(
            "/categories",
            get(get_categories)
                .post(post_categories)
                .options(options_ok),
        )
        .route("/sync", post(post_sync).options(options_ok))
        .with_state(state)
        .layer(cors)
}

async fn options_ok() -> impl IntoResponse {
    StatusCode::OK
}

async fn health() -> Response {
    ok(HealthInfo {
        service: "tracker_core",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn post_event(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let trigger: Trigger = match serde_json::from_value(payload) {
        Ok(t) => t,
        Err(err) => {
            warn!("rejected trigger: {err}");
            return fail(StatusCode::BAD_REQUEST, "invalid_json");
        }
    };
    match state.controller.trigger(trigger).await {
        Ok(()) => ok_empty(),
        Err(_) => controller_gone(),
    }
}

async fn get_stats(State(state): State<AppState>) -> Response {
    match state.controller.stats().await {
        Ok(summary) => ok(summary),
        Err(_) => controller_gone(),
    }
}

async fn post_clear(State(state): State<AppState>) -> Response {
    match state.controller.clear().await {
        Ok(Ok(())) => ok_empty(),
        Ok(Err(err)) => {
            error!("clear failed: {err}");
            fail(StatusCode::INTERNAL_SERVER_ERROR, "db_error")
        }
        Err(_) => controller_gone(),
    }
}

async fn get_categories(State(state): State<AppState>) -> Response {
    match state.controller.categories().await {
        Ok(stats) => ok(stats),
        Err(_) => controller_gone(),
    }
}

async fn post_categories(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let Ok(req) = serde_json::from_value::<CategoryUpdate>(payload) else {
        return fail(StatusCode::BAD_REQUEST, "invalid_json");
    };
    let category: Category = match req.category.parse() {
        Ok(c) => c,
        Err(_) => return fail(StatusCode::BAD_REQUEST, "invalid_category"),
    };
    match state.controller.set_category(req.domain, category).await {
        Ok(Ok(())) => ok_empty(),
        Ok(Err(CategoryError::EmptyDomain)) => fail(StatusCode::BAD_REQUEST, "invalid_domain"),
        Ok(Err(CategoryError::UnknownCategory(_))) => {
            fail(StatusCode::BAD_REQUEST, "invalid_category")
        }
        Ok(Err(CategoryError::Store(err))) => {
            error!("set_override failed: {err}");
            fail(StatusCode::INTERNAL_SERVER_ERROR, "db_error")
        }
        Err(_) => controller_gone(),
    }
}

async fn post_sync(State(state): State<AppState>) -> Response {
    let Some(sync) = state.sync else {
        return fail(StatusCode::SERVICE_UNAVAILABLE, "sync_disabled");
    };
    ok(sync.flush().await)
}
