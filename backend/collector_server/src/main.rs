use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

const DEFAULT_PORT: u16 = 5000;
const TZ_OFFSET_MINUTES_MIN: i32 = -14 * 60;
const TZ_OFFSET_MINUTES_MAX: i32 = 14 * 60;
const DEVICE_ID_MAX_LEN: usize = 128;
const DEFAULT_DAYS: i64 = 7;
const MAX_DAYS: i64 = 365;
const DEFAULT_PAGE_LIMIT: i64 = 50;
const MAX_PAGE_LIMIT: i64 = 500;
const TOP_DOMAINS: usize = 10;
const CATEGORIES: [&str; 3] = ["productive", "unproductive", "neutral"];

#[derive(Parser, Debug)]
#[command(name = "collector_server", version)]
struct Args {
    /// Listen address.
    ///
    /// Accepts:
    /// - ip:port (recommended), e.g. 127.0.0.1:5000
    /// - ip (implies port 5000), e.g. 127.0.0.1
    /// - localhost or localhost:port
    #[arg(long, default_value = "127.0.0.1:5000")]
    listen: String,

    /// SQLite database path.
    #[arg(long, default_value = "./data/collector.db")]
    db: PathBuf,
}

#[derive(Clone)]
struct AppState {
    conn: Arc<Mutex<Connection>>,
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
#[serde(rename_all = "camelCase")]
struct DeviceRegistration {
    #[serde(default)]
    device_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceRecord {
    id: String,
    created_at: String,
    last_sync: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingSession {
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    end_time: Option<String>,
    #[serde(default)]
    duration_seconds: Option<i64>,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchUpload {
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    sessions: Option<Vec<IncomingSession>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SingleUpload {
    #[serde(default)]
    device_id: Option<String>,
    #[serde(flatten)]
    session: IncomingSession,
}

/// A session that passed validation, with timestamps normalized to whole-second UTC.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionRow {
    domain: String,
    url: Option<String>,
    start_time: String,
    end_time: Option<String>,
    duration_seconds: i64,
    category: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StoredSession {
    id: String,
    device_id: String,
    domain: String,
    url: Option<String>,
    start_time: String,
    end_time: Option<String>,
    duration_seconds: i64,
    category: String,
    created_at: String,
}

#[derive(Deserialize)]
struct SessionsQuery {
    limit: Option<i64>,
    offset: Option<i64>,
    days: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Pagination {
    total: i64,
    limit: i64,
    offset: i64,
    has_more: bool,
}

#[derive(Deserialize)]
struct AnalyticsQuery {
    days: Option<i64>,
    tz_offset_minutes: Option<i32>,
}

#[derive(Clone)]
struct AnalyticsRow {
    domain: String,
    start_time: OffsetDateTime,
    duration_seconds: i64,
    category: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct Overall {
    total_seconds: i64,
    total_sessions: usize,
    unique_domains: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct DomainTotal {
    domain: String,
    seconds: i64,
    sessions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct CategoryTotal {
    category: String,
    seconds: i64,
    sessions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct DailyTotal {
    date: String,
    seconds: i64,
    sessions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct Analytics {
    device_id: String,
    period: Value,
    overall: Overall,
    top_domains: Vec<DomainTotal>,
    category_breakdown: Vec<CategoryTotal>,
    daily_stats: Vec<DailyTotal>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collector_server=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    if let Some(parent) = args.db.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(&args.db)?;
    init_db(&conn)?;

    let state = AppState {
        conn: Arc::new(Mutex::new(conn)),
    };
    let app = build_router(state);

    let addr = parse_listen(&args.listen)?;
    info!("Collector listening on http://{addr}/api");
    info!("DB: {}", args.db.display());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    let api = Router::new()
        .route("/health", get(health))
        .route("/devices", post(post_device).options(options_ok))
        .route("/devices/:device_id", get(get_device))
        .route("/sessions", post(post_session).options(options_ok))
        .route(
            "/sessions/batch",
            post(post_sessions_batch).options(options_ok),
        )
        .route(
            "/sessions/:device_id",
            get(get_sessions)
                .delete(delete_sessions)
                .options(options_ok),
        )
        .route("/analytics/:device_id", get(get_analytics));

    Router::new()
        .nest("/api", api)
        .with_state(state)
        .layer(cors)
}

fn parse_listen(input: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    if input == "localhost" {
        return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), DEFAULT_PORT));
    }

    if let Some(port_str) = input.strip_prefix("localhost:") {
        let port: u16 = port_str.parse().map_err(|_| {
            anyhow::anyhow!(
                "invalid --listen '{}': bad port. Example: 127.0.0.1:{}",
                input,
                DEFAULT_PORT
            )
        })?;
        return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), port));
    }

    Err(anyhow::anyhow!(
        "invalid --listen '{}'. Use ip:port (e.g. 127.0.0.1:{}) or ip (e.g. 127.0.0.1).",
        input,
        DEFAULT_PORT
    ))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

async fn options_ok() -> impl IntoResponse {
    StatusCode::OK
}

fn err(status: StatusCode, error: &'static str) -> Response {
    (status, Json(ErrResponse { ok: false, error })).into_response()
}

fn db_error(context: &str, e: rusqlite::Error) -> Response {
    error!("{context} failed: {e}");
    err(StatusCode::INTERNAL_SERVER_ERROR, "db_error")
}

#[derive(Serialize)]
struct HealthInfo {
    service: &'static str,
    version: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(OkResponse {
        ok: true,
        data: Some(HealthInfo {
            service: "collector_server",
            version: env!("CARGO_PKG_VERSION"),
        }),
    })
}

fn valid_device_id(raw: Option<&str>) -> Option<&str> {
    let id = raw?.trim();
    (!id.is_empty() && id.len() <= DEVICE_ID_MAX_LEN).then_some(id)
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .replace_nanosecond(0)
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// Parses an RFC 3339 timestamp and re-emits it as whole-second UTC, so stored
/// values compare correctly as text.
fn normalize_ts(raw: &str) -> Option<String> {
    let parsed = OffsetDateTime::parse(raw.trim(), &Rfc3339).ok()?;
    parsed
        .to_offset(time::UtcOffset::UTC)
        .replace_nanosecond(0)
        .ok()?
        .format(&Rfc3339)
        .ok()
}

fn normalize_category(raw: Option<&str>) -> &'static str {
    let Some(raw) = raw else {
        return "neutral";
    };
    let lowered = raw.trim().to_lowercase();
    match CATEGORIES.iter().copied().find(|c| *c == lowered) {
        Some(c) => c,
        None => {
            warn!("unknown category '{raw}' stored as neutral");
            "neutral"
        }
    }
}

fn validate_session(s: IncomingSession) -> Result<SessionRow, &'static str> {
    let domain = s
        .domain
        .map(|d| d.trim().to_lowercase())
        .filter(|d| !d.is_empty())
        .ok_or("missing_domain")?;
    let start_time = s
        .start_time
        .as_deref()
        .ok_or("missing_start_time")
        .and_then(|t| normalize_ts(t).ok_or("invalid_ts"))?;
    let end_time = match s.end_time.as_deref() {
        None | Some("") => None,
        Some(t) => Some(normalize_ts(t).ok_or("invalid_ts")?),
    };
    Ok(SessionRow {
        domain,
        url: s.url.filter(|u| !u.is_empty()),
        start_time,
        end_time,
        duration_seconds: s.duration_seconds.unwrap_or(0).max(0),
        category: normalize_category(s.category.as_deref()),
    })
}

fn normalize_days(v: Option<i64>) -> i64 {
    v.unwrap_or(DEFAULT_DAYS).clamp(1, MAX_DAYS)
}

fn normalize_tz_offset_minutes(v: Option<i32>) -> i32 {
    v.unwrap_or(0)
        .clamp(TZ_OFFSET_MINUTES_MIN, TZ_OFFSET_MINUTES_MAX)
}

fn tz_offset_from_minutes(minutes: i32) -> time::UtcOffset {
    time::UtcOffset::from_whole_seconds(minutes.saturating_mul(60))
        .unwrap_or(time::UtcOffset::UTC)
}

fn window_start(now: OffsetDateTime, days: i64) -> String {
    (now - time::Duration::days(days))
        .replace_nanosecond(0)
        .unwrap_or(now)
        .format(&Rfc3339)
        .unwrap_or_default()
}

async fn post_device(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let Ok(req) = serde_json::from_value::<DeviceRegistration>(payload) else {
        return err(StatusCode::BAD_REQUEST, "invalid_json");
    };
    let Some(device_id) = valid_device_id(req.device_id.as_deref()) else {
        return err(StatusCode::BAD_REQUEST, "missing_device_id");
    };

    let now = now_rfc3339();
    let conn = state.conn.lock().await;
    match upsert_device(&conn, device_id, &now) {
        Ok(true) => {
            info!("device registered: {device_id}");
            (
                StatusCode::CREATED,
                Json(json!({ "message": "Device registered", "deviceId": device_id })),
            )
                .into_response()
        }
        Ok(false) => {
            Json(json!({ "message": "Device updated", "deviceId": device_id })).into_response()
        }
        Err(e) => db_error("upsert_device", e),
    }
}

async fn get_device(State(state): State<AppState>, Path(device_id): Path<String>) -> Response {
    let conn = state.conn.lock().await;
    match load_device(&conn, &device_id) {
        Ok(Some(device)) => Json(device).into_response(),
        Ok(None) => err(StatusCode::NOT_FOUND, "not_found"),
        Err(e) => db_error("load_device", e),
    }
}

async fn post_sessions_batch(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let Ok(req) = serde_json::from_value::<BatchUpload>(payload) else {
        return err(StatusCode::BAD_REQUEST, "invalid_json");
    };
    let (Some(device_id), Some(sessions)) = (valid_device_id(req.device_id.as_deref()), req.sessions)
    else {
        return err(StatusCode::BAD_REQUEST, "missing_fields");
    };

    // One bad record rejects the whole batch so the client never half-syncs.
    let rows = match sessions
        .into_iter()
        .map(validate_session)
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(rows) => rows,
        Err(code) => return err(StatusCode::BAD_REQUEST, code),
    };

    let now = now_rfc3339();
    let mut conn = state.conn.lock().await;
    match insert_sessions(&mut conn, device_id, &rows, &now) {
        Ok(ids) => {
            let count = ids.len();
            info!("batch from {device_id}: {count} sessions");
            Json(json!({ "message": "Sessions synced", "count": count })).into_response()
        }
        Err(e) => db_error("insert_sessions", e),
    }
}

async fn post_session(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let Ok(req) = serde_json::from_value::<SingleUpload>(payload) else {
        return err(StatusCode::BAD_REQUEST, "invalid_json");
    };
    let Some(device_id) = valid_device_id(req.device_id.as_deref()) else {
        return err(StatusCode::BAD_REQUEST, "missing_fields");
    };
    let row = match validate_session(req.session) {
        Ok(row) => row,
        Err(code) => return err(StatusCode::BAD_REQUEST, code),
    };

    let now = now_rfc3339();
    let mut conn = state.conn.lock().await;
    match insert_sessions(&mut conn, device_id, std::slice::from_ref(&row), &now) {
        Ok(ids) => (
            StatusCode::CREATED,
            Json(json!({ "message": "Session saved", "sessionId": ids.first() })),
        )
            .into_response(),
        Err(e) => db_error("insert_sessions", e),
    }
}

async fn get_sessions(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(q): Query<SessionsQuery>,
) -> Response {
    let limit = q.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
    let offset = q.offset.unwrap_or(0).max(0);
    let since = window_start(OffsetDateTime::now_utc(), normalize_days(q.days));

    let conn = state.conn.lock().await;
    let total = match count_sessions_since(&conn, &device_id, &since) {
        Ok(v) => v,
        Err(e) => return db_error("count_sessions_since", e),
    };
    match list_sessions_since(&conn, &device_id, &since, limit, offset) {
        Ok(sessions) => Json(json!({
            "sessions": sessions,
            "pagination": Pagination {
                total,
                limit,
                offset,
                has_more: offset + limit < total,
            },
        }))
        .into_response(),
        Err(e) => db_error("list_sessions_since", e),
    }
}

async fn delete_sessions(State(state): State<AppState>, Path(device_id): Path<String>) -> Response {
    let conn = state.conn.lock().await;
    match conn.execute("DELETE FROM sessions WHERE device_id = ?1", [&device_id]) {
        Ok(count) => {
            info!("deleted {count} sessions for {device_id}");
            Json(json!({ "message": "Sessions deleted", "count": count })).into_response()
        }
        Err(e) => db_error("delete_sessions", e),
    }
}

async fn get_analytics(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(q): Query<AnalyticsQuery>,
) -> Response {
    let days = normalize_days(q.days);
    let tz = tz_offset_from_minutes(normalize_tz_offset_minutes(q.tz_offset_minutes));
    let since = window_start(OffsetDateTime::now_utc(), days);

    let conn = state.conn.lock().await;
    match list_analytics_rows(&conn, &device_id, &since) {
        Ok(rows) => Json(summarize(&device_id, days, &rows, tz)).into_response(),
        Err(e) => db_error("list_analytics_rows", e),
    }
}

fn summarize(device_id: &str, days: i64, rows: &[AnalyticsRow], tz: time::UtcOffset) -> Analytics {
    let mut by_domain: HashMap<&str, DomainTotal> = HashMap::new();
    let mut by_category: HashMap<&str, CategoryTotal> = HashMap::new();
    let mut by_day: BTreeMap<String, DailyTotal> = BTreeMap::new();
    let mut domains: HashSet<&str> = HashSet::new();
    let mut total_seconds = 0i64;

    for r in rows {
        total_seconds += r.duration_seconds;
        domains.insert(r.domain.as_str());

        let d = by_domain.entry(r.domain.as_str()).or_insert_with(|| DomainTotal {
            domain: r.domain.clone(),
            seconds: 0,
            sessions: 0,
        });
        d.seconds += r.duration_seconds;
        d.sessions += 1;

        let c = by_category
            .entry(r.category.as_str())
            .or_insert_with(|| CategoryTotal {
                category: r.category.clone(),
                seconds: 0,
                sessions: 0,
            });
        c.seconds += r.duration_seconds;
        c.sessions += 1;

        let date = r.start_time.to_offset(tz).date().to_string();
        let day = by_day.entry(date.clone()).or_insert_with(|| DailyTotal {
            date,
            seconds: 0,
            sessions: 0,
        });
        day.seconds += r.duration_seconds;
        day.sessions += 1;
    }

    let mut top_domains: Vec<DomainTotal> = by_domain.into_values().collect();
    top_domains.sort_by(|a, b| b.seconds.cmp(&a.seconds).then_with(|| a.domain.cmp(&b.domain)));
    top_domains.truncate(TOP_DOMAINS);

    let mut category_breakdown: Vec<CategoryTotal> = by_category.into_values().collect();
    category_breakdown
        .sort_by(|a, b| b.seconds.cmp(&a.seconds).then_with(|| a.category.cmp(&b.category)));

    Analytics {
        device_id: device_id.to_string(),
        period: json!({ "days": days }),
        overall: Overall {
            total_seconds,
            total_sessions: rows.len(),
            unique_domains: domains.len(),
        },
        top_domains,
        category_breakdown,
        daily_stats: by_day.into_values().collect(),
    }
}

fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS devices (
  id TEXT PRIMARY KEY,
  created_at TEXT NOT NULL,
  last_sync TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
  id TEXT PRIMARY KEY,
  device_id TEXT NOT NULL,
  domain TEXT NOT NULL,
  url TEXT,
  start_time TEXT NOT NULL,
  end_time TEXT,
  duration_seconds INTEGER NOT NULL DEFAULT 0,
  category TEXT NOT NULL DEFAULT 'neutral',
  created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_device_start ON sessions(device_id, start_time);
"#,
    )
}

/// Returns true when the device was newly created.
fn upsert_device(conn: &Connection, device_id: &str, now: &str) -> rusqlite::Result<bool> {
    let existing: Option<String> = conn
        .query_row("SELECT id FROM devices WHERE id = ?1", [device_id], |r| r.get(0))
        .optional()?;
    conn.execute(
        r#"
INSERT INTO devices (id, created_at, last_sync)
VALUES (?1, ?2, ?2)
ON CONFLICT(id) DO UPDATE SET
  last_sync=excluded.last_sync
"#,
        (device_id, now),
    )?;
    Ok(existing.is_none())
}

fn load_device(conn: &Connection, device_id: &str) -> rusqlite::Result<Option<DeviceRecord>> {
    conn.query_row(
        "SELECT id, created_at, last_sync FROM devices WHERE id = ?1",
        [device_id],
        |r| {
            Ok(DeviceRecord {
                id: r.get(0)?,
                created_at: r.get(1)?,
                last_sync: r.get(2)?,
            })
        },
    )
    .optional()
}

/// Inserts all rows in one transaction and refreshes the device's last sync time.
/// Returns the generated session ids in input order.
fn insert_sessions(
    conn: &mut Connection,
    device_id: &str,
    rows: &[SessionRow],
    now: &str,
) -> rusqlite::Result<Vec<String>> {
    let tx = conn.transaction()?;
    tx.execute(
        r#"
INSERT INTO devices (id, created_at, last_sync)
VALUES (?1, ?2, ?2)
ON CONFLICT(id) DO UPDATE SET
  last_sync=excluded.last_sync
"#,
        (device_id, now),
    )?;
    let mut ids = Vec::with_capacity(rows.len());
    {
        let mut stmt = tx.prepare(
            r#"
INSERT INTO sessions (id, device_id, domain, url, start_time, end_time, duration_seconds, category, created_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
"#,
        )?;
        for row in rows {
            let id = uuid::Uuid::new_v4().to_string();
            stmt.execute((
                &id,
                device_id,
                &row.domain,
                &row.url,
                &row.start_time,
                &row.end_time,
                row.duration_seconds,
                row.category,
                now,
            ))?;
            ids.push(id);
        }
    }
    tx.commit()?;
    Ok(ids)
}

fn count_sessions_since(conn: &Connection, device_id: &str, since: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM sessions WHERE device_id = ?1 AND start_time >= ?2",
        (device_id, since),
        |r| r.get(0),
    )
}

fn list_sessions_since(
    conn: &Connection,
    device_id: &str,
    since: &str,
    limit: i64,
    offset: i64,
) -> rusqlite::Result<Vec<StoredSession>> {
    let mut stmt = conn.prepare(
        r#"
SELECT id, device_id, domain, url, start_time, end_time, duration_seconds, category, created_at
FROM sessions
WHERE device_id = ?1 AND start_time >= ?2
ORDER BY start_time DESC
LIMIT ?3 OFFSET ?4
"#,
    )?;
    let rows = stmt.query_map((device_id, since, limit, offset), |r| {
        Ok(StoredSession {
            id: r.get(0)?,
            device_id: r.get(1)?,
            domain: r.get(2)?,
            url: r.get(3)?,
            start_time: r.get(4)?,
            end_time: r.get(5)?,
            duration_seconds: r.get(6)?,
            category: r.get(7)?,
            created_at: r.get(8)?,
        })
    })?;
    rows.collect()
}

fn list_analytics_rows(
    conn: &Connection,
    device_id: &str,
    since: &str,
) -> rusqlite::Result<Vec<AnalyticsRow>> {
    let mut stmt = conn.prepare(
        "SELECT domain, start_time, duration_seconds, category FROM sessions WHERE device_id = ?1 AND start_time >= ?2 ORDER BY start_time ASC",
    )?;
    let rows = stmt.query_map((device_id, since), |r| {
        let ts: String = r.get(1)?;
        let start_time = OffsetDateTime::parse(&ts, &Rfc3339).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(AnalyticsRow {
            domain: r.get(0)?,
            start_time,
            duration_seconds: r.get(2)?,
            category: r.get(3)?,
        })
    })?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    fn ts(s: &str) -> OffsetDateTime {
        OffsetDateTime::parse(s, &Rfc3339).unwrap()
    }

    fn row(domain: &str, start: &str, secs: i64, category: &str) -> AnalyticsRow {
        AnalyticsRow {
            domain: domain.to_string(),
            start_time: ts(start),
            duration_seconds: secs,
            category: category.to_string(),
        }
    }

    #[test]
    fn normalize_ts_outputs_whole_second_utc() {
        assert_eq!(
            normalize_ts("2026-03-02T17:00:00.123+08:00").as_deref(),
            Some("2026-03-02T09:00:00Z")
        );
        assert_eq!(
            normalize_ts("2026-03-02T09:00:00.999Z").as_deref(),
            Some("2026-03-02T09:00:00Z")
        );
        assert_eq!(normalize_ts("yesterday"), None);
    }

    #[test]
    fn validate_session_defaults_and_rejects() {
        let ok = validate_session(IncomingSession {
            domain: Some(" GitHub.com ".to_string()),
            url: None,
            start_time: Some("2026-03-02T09:00:00Z".to_string()),
            end_time: None,
            duration_seconds: Some(-4),
            category: Some("sometimes".to_string()),
        })
        .unwrap();
        assert_eq!(ok.domain, "github.com");
        assert_eq!(ok.duration_seconds, 0);
        assert_eq!(ok.category, "neutral");
        assert_eq!(ok.end_time, None);

        let missing = validate_session(IncomingSession {
            domain: Some("a.com".to_string()),
            url: None,
            start_time: None,
            end_time: None,
            duration_seconds: None,
            category: None,
        });
        assert_eq!(missing, Err("missing_start_time"));

        let bad_end = validate_session(IncomingSession {
            domain: Some("a.com".to_string()),
            url: None,
            start_time: Some("2026-03-02T09:00:00Z".to_string()),
            end_time: Some("soon".to_string()),
            duration_seconds: None,
            category: None,
        });
        assert_eq!(bad_end, Err("invalid_ts"));
    }

    #[test]
    fn summarize_groups_and_orders() {
        let rows = vec![
            row("github.com", "2026-03-01T10:00:00Z", 600, "productive"),
            row("youtube.com", "2026-03-01T11:00:00Z", 900, "unproductive"),
            row("github.com", "2026-03-02T09:00:00Z", 400, "productive"),
            row("news.example.com", "2026-03-02T09:30:00Z", 100, "neutral"),
        ];
        let a = summarize("dev-1", 7, &rows, time::UtcOffset::UTC);
        assert_eq!(
            a.overall,
            Overall {
                total_seconds: 2000,
                total_sessions: 4,
                unique_domains: 3,
            }
        );
        assert_eq!(a.top_domains[0].domain, "github.com");
        assert_eq!(a.top_domains[0].seconds, 1000);
        assert_eq!(a.top_domains[0].sessions, 2);
        assert_eq!(a.category_breakdown[0].category, "productive");
        assert_eq!(a.category_breakdown[1].category, "unproductive");
        let days: Vec<(&str, i64)> = a
            .daily_stats
            .iter()
            .map(|d| (d.date.as_str(), d.seconds))
            .collect();
        assert_eq!(days, vec![("2026-03-01", 1500), ("2026-03-02", 500)]);
    }

    #[test]
    fn summarize_buckets_days_in_local_offset() {
        let rows = vec![
            row("a.com", "2026-03-01T15:00:00Z", 60, "neutral"),
            row("a.com", "2026-03-01T17:00:00Z", 60, "neutral"),
        ];
        let tz = tz_offset_from_minutes(8 * 60);
        let a = summarize("dev-1", 7, &rows, tz);
        let days: Vec<&str> = a.daily_stats.iter().map(|d| d.date.as_str()).collect();
        assert_eq!(days, vec!["2026-03-01", "2026-03-02"]);
    }

    #[test]
    fn top_domains_capped_at_ten() {
        let rows: Vec<AnalyticsRow> = (0..15)
            .map(|n| row(&format!("site{n:02}.com"), "2026-03-01T10:00:00Z", n, "neutral"))
            .collect();
        let a = summarize("dev-1", 7, &rows, time::UtcOffset::UTC);
        assert_eq!(a.top_domains.len(), 10);
        assert_eq!(a.top_domains[0].domain, "site14.com");
    }

    #[test]
    fn listen_and_tz_parsing() {
        assert_eq!(
            parse_listen("127.0.0.1").unwrap(),
            "127.0.0.1:5000".parse().unwrap()
        );
        assert_eq!(
            parse_listen("localhost:5050").unwrap(),
            "127.0.0.1:5050".parse().unwrap()
        );
        assert!(parse_listen("nope").is_err());
        assert_eq!(normalize_tz_offset_minutes(Some(99 * 60)), 14 * 60);
        assert_eq!(normalize_days(Some(0)), 1);
        assert_eq!(normalize_days(None), 7);
    }

    fn app() -> Router {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        build_router(AppState {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(b) => builder
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let res = router.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn hours_ago(h: i64) -> String {
        (OffsetDateTime::now_utc() - time::Duration::hours(h))
            .replace_nanosecond(0)
            .unwrap()
            .format(&Rfc3339)
            .unwrap()
    }

    #[tokio::test]
    async fn device_registration_is_idempotent() {
        let app = app();
        let (status, body) = call(&app, "POST", "/api/devices", Some(json!({ "deviceId": "dev-1" }))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["deviceId"], "dev-1");

        let (status, body) = call(&app, "POST", "/api/devices", Some(json!({ "deviceId": "dev-1" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Device updated");

        let (status, body) = call(&app, "GET", "/api/devices/dev-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "dev-1");

        let (status, _) = call(&app, "GET", "/api/devices/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, "POST", "/api/devices", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "missing_device_id");
    }

    #[tokio::test]
    async fn batch_then_list_analytics_and_delete() {
        let app = app();
        let batch = json!({
            "deviceId": "dev-1",
            "sessions": [
                { "domain": "github.com", "url": "https://github.com/", "startTime": hours_ago(3),
                  "endTime": hours_ago(2), "durationSeconds": 3600, "category": "productive" },
                { "domain": "youtube.com", "url": "https://youtube.com/", "startTime": hours_ago(2),
                  "endTime": hours_ago(1), "durationSeconds": 1200, "category": "unproductive" },
                { "domain": "old.com", "startTime": hours_ago(24 * 30), "durationSeconds": 50 }
            ]
        });
        let (status, body) = call(&app, "POST", "/api/sessions/batch", Some(batch)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "message": "Sessions synced", "count": 3 }));

        // Batch upload registers the device on the way.
        let (status, _) = call(&app, "GET", "/api/devices/dev-1", None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&app, "GET", "/api/sessions/dev-1?limit=1", None).await;
        assert_eq!(body["pagination"]["total"], 2);
        assert_eq!(body["pagination"]["hasMore"], true);
        assert_eq!(body["sessions"][0]["domain"], "youtube.com");

        let (_, body) = call(&app, "GET", "/api/sessions/dev-1?days=60&offset=2", None).await;
        assert_eq!(body["pagination"]["total"], 3);
        assert_eq!(body["sessions"][0]["domain"], "old.com");
        assert_eq!(body["pagination"]["hasMore"], false);

        let (_, body) = call(&app, "GET", "/api/analytics/dev-1?days=7", None).await;
        assert_eq!(body["overall"]["totalSeconds"], 4800);
        assert_eq!(body["overall"]["uniqueDomains"], 2);
        assert_eq!(body["topDomains"][0]["domain"], "github.com");
        assert_eq!(body["categoryBreakdown"][1]["category"], "unproductive");
        assert_eq!(body["period"]["days"], 7);

        let (_, body) = call(&app, "DELETE", "/api/sessions/dev-1", None).await;
        assert_eq!(body["count"], 3);
        let (_, body) = call(&app, "GET", "/api/analytics/dev-1", None).await;
        assert_eq!(body["overall"]["totalSessions"], 0);
    }

    #[tokio::test]
    async fn bad_batches_are_rejected_whole() {
        let app = app();
        let (status, body) = call(
            &app,
            "POST",
            "/api/sessions/batch",
            Some(json!({
                "deviceId": "dev-1",
                "sessions": [
                    { "domain": "a.com", "startTime": hours_ago(1) },
                    { "domain": "b.com", "startTime": "not a time" }
                ]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_ts");

        let (status, body) = call(&app, "POST", "/api/sessions/batch", Some(json!({ "deviceId": "dev-1" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "missing_fields");

        let (_, body) = call(&app, "GET", "/api/sessions/dev-1", None).await;
        assert_eq!(body["pagination"]["total"], 0);
    }

    #[tokio::test]
    async fn single_session_upload() {
        let app = app();
        let (status, body) = call(
            &app,
            "POST",
            "/api/sessions",
            Some(json!({
                "deviceId": "dev-2",
                "domain": "docs.rs",
                "startTime": hours_ago(1),
                "durationSeconds": 42,
                "category": "productive"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(body["sessionId"].is_string());

        let (_, body) = call(&app, "GET", "/api/sessions/dev-2", None).await;
        assert_eq!(body["sessions"][0]["durationSeconds"], 42);
        assert_eq!(body["sessions"][0]["category"], "productive");
    }
}
