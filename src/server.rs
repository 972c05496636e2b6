//! Axum REST API server for the submarine console.
//!
//! Reads are open to everyone; every handler that changes state takes an
//! [`OperatorAuth`] extractor so it sits behind the operator gate.

use std::any::Any;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use axum::{
    async_trait,
    extract::{
        DefaultBodyLimit, FromRef, FromRequestParts, Multipart, Path, Query, State as AxumState,
    },
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as CorsAny, CorsLayer};
use tower_http::services::ServeDir;

use crate::auth::{OperatorAuth, OperatorGate};
use crate::config::{ServerConfig, VehicleLimits, UPLOAD_SUBDIR};
use crate::database::{Database, DatabaseError};
use crate::models::{
    now_timestamp, AutonomyState, AutonomyStateUpdate, CreateEventPayload, CreateMissionPayload,
    CreateVideoClipPayload, EventLevel, EventLogEntry, IngestTelemetryPayload, LogLine,
    ManualCommand, Mission, MissionMode, MissionStatus, NewEvent, NewTargetImage, TargetImage,
    TelemetrySample, VideoClip,
};
use crate::seed;
use crate::simulator::TelemetrySimulator;
use crate::uploads;

const DEFAULT_TELEMETRY_LIMIT: usize = 50;
const MAX_TELEMETRY_LIMIT: usize = 500;
const DEFAULT_EVENTS_LIMIT: usize = 30;
const MAX_EVENTS_LIMIT: usize = 200;
const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 500;
const DEFAULT_COMMANDS_LIMIT: usize = 50;
const LOGS_LIMIT: usize = 100;
const DEFAULT_MISSION_NAME: &str = "Untitled Mission";
const DEFAULT_CLIP_LABEL: &str = "clip";
const DEFAULT_COMMAND: &str = "manual";

/// Shared application state for Axum handlers
#[derive(Clone)]
pub struct WebAppState {
    pub db: Arc<Database>,
    pub gate: OperatorGate,
    pub static_dir: PathBuf,
}

impl WebAppState {
    pub fn new(db: Arc<Database>, gate: OperatorGate, static_dir: PathBuf) -> Self {
        Self {
            db,
            gate,
            static_dir,
        }
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.static_dir.join(UPLOAD_SUBDIR)
    }
}

impl FromRef<WebAppState> for OperatorGate {
    fn from_ref(state: &WebAppState) -> Self {
        state.gate.clone()
    }
}

/// Standard error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            detail: None,
        }
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn err_response(status: StatusCode, msg: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse::new(msg)))
}

fn server_error(detail: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "server error".to_string(),
            detail: Some(detail.to_string()),
        }),
    )
}

/// Map a storage failure onto the API: missing rows are a 404, the rest a 500.
fn db_error(e: DatabaseError) -> ApiError {
    match e {
        DatabaseError::NotFound { entity, id } => {
            log::info!("{} {} not found", entity, id);
            err_response(StatusCode::NOT_FOUND, "not found")
        }
        other => {
            log::error!("Storage failure: {}", other);
            server_error(other)
        }
    }
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "handler panicked".to_string()
    };
    log::error!("Request handler panicked: {}", detail);
    server_error(detail).into_response()
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

impl LimitQuery {
    /// Requested limit, defaulted when absent and clamped to `0..=max`.
    fn resolve(&self, default: usize, max: usize) -> usize {
        match self.limit {
            None => default,
            Some(n) if n <= 0 => 0,
            Some(n) => (n as u64).min(max as u64) as usize,
        }
    }
}

/// `""`/absent means no value; anything else must be an integer.
fn parse_optional_id(raw: Option<&str>, name: &str) -> Result<Option<i64>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => s
            .parse::<i64>()
            .map(Some)
            .map_err(|_| err_response(StatusCode::BAD_REQUEST, format!("invalid {}", name))),
    }
}

/// Integer id taken from the path. A segment that is not an integer is
/// answered like an unmatched route.
struct RecordId(i64);

#[async_trait]
impl<S> FromRequestParts<S> for RecordId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Path::<i64>::from_request_parts(parts, state).await {
            Ok(Path(id)) => Ok(RecordId(id)),
            Err(rejection) => {
                log::debug!("No route for {}: {}", parts.uri.path(), rejection);
                Err(err_response(StatusCode::NOT_FOUND, "not found"))
            }
        }
    }
}

// ============================================================================
// ROUTE HANDLERS
// ============================================================================

/// GET /api/health
async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "time": now_timestamp() }))
}

/// GET /api/config — static vehicle limits
async fn get_config() -> Json<VehicleLimits> {
    Json(VehicleLimits::default())
}

/// GET /api/missions — newest first
async fn list_missions(
    AxumState(state): AxumState<WebAppState>,
) -> Result<Json<Vec<Mission>>, ApiError> {
    state.db.list_missions().map(Json).map_err(db_error)
}

/// POST /api/missions — create, then return the refreshed list
async fn create_mission(
    _auth: OperatorAuth,
    AxumState(state): AxumState<WebAppState>,
    Json(payload): Json<CreateMissionPayload>,
) -> Result<(StatusCode, Json<Vec<Mission>>), ApiError> {
    let name = payload
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| DEFAULT_MISSION_NAME.to_string());
    let status = payload.status.unwrap_or(MissionStatus::Planned);
    let mode = payload.mode.unwrap_or(MissionMode::Manual);

    let mission = state
        .db
        .create_mission(&name, &status, &mode)
        .map_err(db_error)?;

    let missions = state.db.list_missions().map_err(db_error)?;
    Ok((StatusCode::CREATED, Json(missions)))
}

/// DELETE /api/missions/:id
async fn delete_mission(
    _auth: OperatorAuth,
    AxumState(state): AxumState<WebAppState>,
    RecordId(mission_id): RecordId,
) -> Result<Json<Value>, ApiError> {
    let mission = state.db.delete_mission(mission_id).map_err(db_error)?;
    log::warn!("Deleted mission {} '{}'", mission.id, mission.name);
    Ok(Json(json!({ "status": "deleted", "id": mission.id })))
}

/// GET /api/telemetry/latest?limit=N — newest window, oldest first
async fn latest_telemetry(
    AxumState(state): AxumState<WebAppState>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<Vec<TelemetrySample>>, ApiError> {
    let limit = params.resolve(DEFAULT_TELEMETRY_LIMIT, MAX_TELEMETRY_LIMIT);
    state.db.latest_telemetry(limit).map(Json).map_err(db_error)
}

/// POST /api/telemetry — manual ingestion
async fn ingest_telemetry(
    _auth: OperatorAuth,
    AxumState(state): AxumState<WebAppState>,
    Json(payload): Json<IngestTelemetryPayload>,
) -> Result<Json<Value>, ApiError> {
    let id = state
        .db
        .ingest_telemetry(payload.mission_id, &payload.point)
        .map_err(db_error)?;
    Ok(Json(json!({ "status": "saved", "id": id })))
}

/// GET /api/events?limit=N
async fn list_events(
    AxumState(state): AxumState<WebAppState>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<Vec<EventLogEntry>>, ApiError> {
    let limit = params.resolve(DEFAULT_EVENTS_LIMIT, MAX_EVENTS_LIMIT);
    state.db.recent_events(None, limit).map(Json).map_err(db_error)
}

/// POST /api/events?limit=N — append, then return the refreshed window
async fn create_event(
    _auth: OperatorAuth,
    AxumState(state): AxumState<WebAppState>,
    Query(params): Query<LimitQuery>,
    Json(payload): Json<CreateEventPayload>,
) -> Result<(StatusCode, Json<Vec<EventLogEntry>>), ApiError> {
    let event = NewEvent {
        mission_id: payload.mission_id,
        level: payload.level.unwrap_or(EventLevel::Info),
        message: payload.message.unwrap_or_default(),
    };
    state.db.append_event(&event).map_err(db_error)?;

    let limit = params.resolve(DEFAULT_EVENTS_LIMIT, MAX_EVENTS_LIMIT);
    let events = state.db.recent_events(None, limit).map_err(db_error)?;
    Ok((StatusCode::CREATED, Json(events)))
}

/// DELETE /api/events/:id
async fn delete_event(
    _auth: OperatorAuth,
    AxumState(state): AxumState<WebAppState>,
    RecordId(event_id): RecordId,
) -> Result<Json<Value>, ApiError> {
    state.db.delete_event(event_id).map_err(db_error)?;
    Ok(Json(json!({ "status": "deleted", "id": event_id })))
}

/// DELETE /api/events — clear the whole log
async fn delete_all_events(
    _auth: OperatorAuth,
    AxumState(state): AxumState<WebAppState>,
) -> Result<Json<Value>, ApiError> {
    let removed = state.db.delete_all_events().map_err(db_error)?;
    log::warn!("Cleared event log ({} entries)", removed);
    Ok(Json(json!({ "status": "deleted_all" })))
}

/// GET /api/video-clips?limit=N — newest window, oldest first
async fn list_video_clips(
    AxumState(state): AxumState<WebAppState>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<Vec<VideoClip>>, ApiError> {
    let limit = params.resolve(DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT);
    state.db.list_video_clips(limit).map(Json).map_err(db_error)
}

/// POST /api/video-clips — register a clip by URL
async fn create_video_clip(
    _auth: OperatorAuth,
    AxumState(state): AxumState<WebAppState>,
    Json(payload): Json<CreateVideoClipPayload>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let url = payload
        .url
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| err_response(StatusCode::BAD_REQUEST, "url is required"))?;
    let label = payload
        .label
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CLIP_LABEL.to_string());

    let id = state
        .db
        .create_video_clip(payload.mission_id, &label, &url)
        .map_err(db_error)?;
    Ok((StatusCode::CREATED, Json(json!({ "status": "saved", "id": id }))))
}

/// DELETE /api/video-clips/:id
async fn delete_video_clip(
    _auth: OperatorAuth,
    AxumState(state): AxumState<WebAppState>,
    RecordId(clip_id): RecordId,
) -> Result<Json<Value>, ApiError> {
    state.db.delete_video_clip(clip_id).map_err(db_error)?;
    Ok(Json(json!({ "status": "deleted", "id": clip_id })))
}

/// DELETE /api/video-clips
async fn delete_all_video_clips(
    _auth: OperatorAuth,
    AxumState(state): AxumState<WebAppState>,
) -> Result<Json<Value>, ApiError> {
    let removed = state.db.delete_all_video_clips().map_err(db_error)?;
    log::warn!("Deleted all video clips ({} entries)", removed);
    Ok(Json(json!({ "status": "deleted_all" })))
}

/// GET /api/targets?limit=N — newest window, oldest first
async fn list_targets(
    AxumState(state): AxumState<WebAppState>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<Vec<TargetImage>>, ApiError> {
    let limit = params.resolve(DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT);
    state.db.list_targets(limit).map(Json).map_err(db_error)
}

/// POST /api/targets/upload — multipart `image` plus optional `mission_id`/`label`
async fn upload_target(
    _auth: OperatorAuth,
    AxumState(state): AxumState<WebAppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut image: Option<(String, Vec<u8>)> = None;
    let mut mission_raw: Option<String> = None;
    let mut label: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| err_response(StatusCode::BAD_REQUEST, format!("Multipart error: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let data = field.bytes().await.map_err(|e| {
                    err_response(StatusCode::BAD_REQUEST, format!("Failed to read file: {}", e))
                })?;
                image = Some((file_name, data.to_vec()));
            }
            "mission_id" | "label" => {
                let text = field.text().await.map_err(|e| {
                    err_response(StatusCode::BAD_REQUEST, format!("Multipart error: {}", e))
                })?;
                if name == "label" {
                    label = Some(text);
                } else {
                    mission_raw = Some(text);
                }
            }
            _ => {}
        }
    }

    let (file_name, data) =
        image.ok_or_else(|| err_response(StatusCode::BAD_REQUEST, "missing file"))?;
    if file_name.trim().is_empty() {
        return Err(err_response(StatusCode::BAD_REQUEST, "empty filename"));
    }
    let mission_id = parse_optional_id(mission_raw.as_deref(), "mission_id")?;
    let label = label
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| uploads::sanitize_filename(&file_name));

    let (stored_name, url) = uploads::save_upload(&state.upload_dir(), &file_name, &data)
        .await
        .map_err(|e| {
            log::error!("Failed to store upload '{}': {}", file_name, e);
            server_error(e)
        })?;

    let created = state.db.create_target(&NewTargetImage {
        mission_id,
        label,
        filename: stored_name.clone(),
        url: url.clone(),
    });
    let target = match created {
        Ok(target) => target,
        Err(e) => {
            let err = db_error(e);
            remove_stored_upload(&state.upload_dir(), &stored_name).await;
            return Err(err);
        }
    };

    Ok(Json(json!({ "status": "uploaded", "id": target.id, "url": url })))
}

/// POST /api/targets/:id/match
async fn match_target(
    _auth: OperatorAuth,
    AxumState(state): AxumState<WebAppState>,
    RecordId(target_id): RecordId,
) -> Result<Json<Value>, ApiError> {
    let target = state.db.match_target(target_id).map_err(db_error)?;
    Ok(Json(json!({ "status": "matched", "id": target.id })))
}

/// DELETE /api/targets/:id — removes the row and its stored file
async fn delete_target(
    _auth: OperatorAuth,
    AxumState(state): AxumState<WebAppState>,
    RecordId(target_id): RecordId,
) -> Result<Json<Value>, ApiError> {
    let target = state.db.delete_target(target_id).map_err(db_error)?;
    remove_stored_upload(&state.upload_dir(), &target.filename).await;
    Ok(Json(json!({ "status": "deleted", "id": target.id })))
}

async fn remove_stored_upload(dir: &FsPath, stored_name: &str) {
    if stored_name.is_empty() {
        return;
    }
    let path = dir.join(stored_name);
    if let Err(e) = tokio::fs::remove_file(&path).await {
        log::warn!("Could not remove upload {}: {}", path.display(), e);
    }
}

/// GET /api/auto/state
async fn get_auto_state(
    AxumState(state): AxumState<WebAppState>,
) -> Result<Json<AutonomyState>, ApiError> {
    state.db.autonomy_state().map(Json).map_err(db_error)
}

/// POST /api/auto/state — partial update
async fn update_auto_state(
    _auth: OperatorAuth,
    AxumState(state): AxumState<WebAppState>,
    Json(update): Json<AutonomyStateUpdate>,
) -> Result<Json<AutonomyState>, ApiError> {
    state
        .db
        .update_autonomy_state(&update)
        .map(Json)
        .map_err(db_error)
}

/// GET /api/commands/manual?limit=N — audit trail, oldest first
async fn list_manual_commands(
    AxumState(state): AxumState<WebAppState>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<Vec<ManualCommand>>, ApiError> {
    let limit = params.resolve(DEFAULT_COMMANDS_LIMIT, MAX_LIST_LIMIT);
    state
        .db
        .recent_manual_commands(limit)
        .map(Json)
        .map_err(db_error)
}

/// POST /api/commands/manual — record an operator command verbatim
async fn manual_command(
    _auth: OperatorAuth,
    AxumState(state): AxumState<WebAppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let command = payload
        .get("command")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .unwrap_or(DEFAULT_COMMAND)
        .to_string();

    state
        .db
        .record_manual_command(&command, &payload)
        .map_err(db_error)?;
    Ok(Json(json!({ "status": "accepted", "command": command })))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    mission_id: Option<String>,
}

/// GET /api/logs?mission_id=N — compact event lines
async fn logs(
    AxumState(state): AxumState<WebAppState>,
    Query(params): Query<LogsQuery>,
) -> Result<Json<Vec<LogLine>>, ApiError> {
    let mission_id = parse_optional_id(params.mission_id.as_deref(), "mission_id")?;
    let events = state
        .db
        .recent_events(mission_id, LOGS_LIMIT)
        .map_err(db_error)?;
    Ok(Json(events.into_iter().map(LogLine::from).collect()))
}

async fn not_found() -> ApiError {
    err_response(StatusCode::NOT_FOUND, "not found")
}

// ============================================================================
// SERVER SETUP
// ============================================================================

/// Build the Axum router with all API routes
pub fn build_router(state: WebAppState) -> Router {
    let static_files = ServeDir::new(&state.static_dir);

    let routes = Router::new()
        .route("/api/health", get(health))
        .route("/api/config", get(get_config))
        .route("/api/missions", get(list_missions).post(create_mission))
        .route("/api/missions/:id", delete(delete_mission))
        .route("/api/telemetry/latest", get(latest_telemetry))
        .route("/api/telemetry", post(ingest_telemetry))
        .route(
            "/api/events",
            get(list_events).post(create_event).delete(delete_all_events),
        )
        .route("/api/events/:id", delete(delete_event))
        .route(
            "/api/video-clips",
            get(list_video_clips)
                .post(create_video_clip)
                .delete(delete_all_video_clips),
        )
        .route("/api/video-clips/:id", delete(delete_video_clip))
        .route("/api/targets", get(list_targets))
        .route("/api/targets/upload", post(upload_target))
        .route("/api/targets/:id", delete(delete_target))
        .route("/api/targets/:id/match", post(match_target))
        .route("/api/auto/state", get(get_auto_state).post(update_auto_state))
        .route(
            "/api/commands/manual",
            get(list_manual_commands).post(manual_command),
        )
        .route("/api/logs", get(logs))
        .nest_service("/static", static_files);

    with_middleware(routes).with_state(state)
}

/// Fallback and layers shared by every route
fn with_middleware(routes: Router<WebAppState>) -> Router<WebAppState> {
    let cors = CorsLayer::new()
        .allow_origin(CorsAny)
        .allow_methods(CorsAny)
        .allow_headers(CorsAny);

    routes
        .fallback(not_found)
        .layer(cors)
        .layer(DefaultBodyLimit::max(25 * 1024 * 1024)) // 25 MB
        .layer(CatchPanicLayer::custom(handle_panic))
}

/// Open storage, start background work and serve until Ctrl-C.
pub async fn start_server(config: ServerConfig) -> anyhow::Result<()> {
    let db = Database::new(config.db_path.clone())
        .with_context(|| format!("opening database {}", config.db_path.display()))?;
    let db = Arc::new(db);

    if config.seed_demo_data {
        seed::seed_demo_data(&db, &mut rand::thread_rng()).context("seeding demo data")?;
    }

    let upload_dir = config.upload_dir();
    tokio::fs::create_dir_all(&upload_dir)
        .await
        .with_context(|| format!("creating upload directory {}", upload_dir.display()))?;

    let gate = OperatorGate::new(config.operator_token.clone(), config.token_header.clone());
    if gate.is_open() {
        log::warn!("OPERATOR_TOKEN is not set; mutating endpoints are open to everyone");
    } else {
        log::info!("Operator gate enabled on header {}", gate.header_name());
    }

    let simulator = if config.simulator_enabled {
        Some(TelemetrySimulator::new(db.clone(), config.simulator_interval).spawn())
    } else {
        log::info!("Telemetry simulator disabled");
        None
    };

    let state = WebAppState::new(db, gate, config.static_dir.clone());
    let router = build_router(state);

    let addr = config.bind_addr();
    log::info!("Starting Submarine Console server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Some(simulator) = simulator {
        simulator.shutdown().await;
    }
    served.context("serving HTTP")?;
    log::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("Shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TargetStatus;
    use reqwest::multipart::{Form, Part};
    use tempfile::TempDir;

    const TOKEN: &str = "s3cret";

    struct TestServer {
        base: String,
        db: Arc<Database>,
        client: reqwest::Client,
        upload_dir: PathBuf,
        _dir: TempDir,
    }

    impl TestServer {
        fn url(&self, path: &str) -> String {
            format!("{}{}", self.base, path)
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn spawn_server(token: Option<&str>) -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::new(dir.path().join("console.db")).unwrap());
        let gate = OperatorGate::new(token.map(str::to_string), "X-Operator-Token");
        let state = WebAppState::new(db.clone(), gate, dir.path().join("static"));
        let upload_dir = state.upload_dir();

        TestServer {
            base: serve(build_router(state)).await,
            db,
            client: reqwest::Client::new(),
            upload_dir,
            _dir: dir,
        }
    }

    async fn explode() -> &'static str {
        panic!("reactor scram")
    }

    #[tokio::test]
    async fn test_health_config_and_unknown_route() {
        let srv = spawn_server(None).await;

        let health: Value = srv.client.get(srv.url("/api/health")).send().await.unwrap().json().await.unwrap();
        assert_eq!(health["status"], "ok");
        assert!(health["time"].is_string());

        let config: Value = srv.client.get(srv.url("/api/config")).send().await.unwrap().json().await.unwrap();
        assert_eq!(config["battery_low_v"], 14.6);
        assert_eq!(config["soft_limits"]["max_throttle"], 0.7);
        assert_eq!(config["roles"], json!(["viewer", "operator", "admin"]));

        let resp = srv.client.get(srv.url("/api/nope")).send().await.unwrap();
        assert_eq!(resp.status(), 404);
        let body: ErrorResponse = resp.json().await.unwrap();
        assert_eq!(body.error, "not found");
    }

    #[tokio::test]
    async fn test_mutations_require_token_and_reads_do_not() {
        let srv = spawn_server(Some(TOKEN)).await;

        let resp = srv
            .client
            .post(srv.url("/api/missions"))
            .json(&json!({ "name": "Dive 1" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
        let body: ErrorResponse = resp.json().await.unwrap();
        assert_eq!(body.error, "unauthorized");
        assert_eq!(srv.db.count_missions().unwrap(), 0);
        assert_eq!(srv.db.count_events().unwrap(), 0);

        let resp = srv
            .client
            .post(srv.url("/api/missions"))
            .header("X-Operator-Token", "wrong")
            .json(&json!({ "name": "Dive 1" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        let resp = srv
            .client
            .post(srv.url("/api/missions"))
            .header("X-Operator-Token", TOKEN)
            .json(&json!({ "name": "Dive 1", "status": "active" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let missions: Vec<Mission> = resp.json().await.unwrap();
        assert_eq!(missions.len(), 1);
        assert_eq!(missions[0].name, "Dive 1");
        assert_eq!(missions[0].status, MissionStatus::Active);
        assert_eq!(missions[0].mode, MissionMode::Manual);
        assert_eq!(srv.db.count_events().unwrap(), 1);

        let resp = srv.client.get(srv.url("/api/missions")).send().await.unwrap();
        assert_eq!(resp.status(), 200);

        let resp = srv.client.delete(srv.url("/api/events")).send().await.unwrap();
        assert_eq!(resp.status(), 401);
        assert_eq!(srv.db.count_events().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mission_defaults_and_delete() {
        let srv = spawn_server(None).await;

        let missions: Vec<Mission> = srv
            .client
            .post(srv.url("/api/missions"))
            .json(&json!({}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(missions[0].name, DEFAULT_MISSION_NAME);
        assert_eq!(missions[0].status, MissionStatus::Planned);
        let id = missions[0].id;

        srv.db
            .append_event(&NewEvent::info(Some(id), "attached"))
            .unwrap();

        let resp = srv
            .client
            .delete(srv.url(&format!("/api/missions/{}", id)))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(srv.db.count_missions().unwrap(), 0);
        // events keep their dangling mission reference
        let events = srv.db.recent_events(Some(id), 10).unwrap();
        assert!(events.iter().any(|e| e.message == "attached"));

        let resp = srv
            .client
            .delete(srv.url(&format!("/api/missions/{}", id)))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_latest_telemetry_limit_and_order() {
        let srv = spawn_server(None).await;
        for i in 0..10 {
            let resp = srv
                .client
                .post(srv.url("/api/telemetry"))
                .json(&json!({ "battery_v": 15.0 + i as f64 * 0.01, "leak": false }))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 200);
            let body: Value = resp.json().await.unwrap();
            assert_eq!(body["status"], "saved");
        }

        let three: Vec<TelemetrySample> = srv
            .client
            .get(srv.url("/api/telemetry/latest?limit=3"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(three.len(), 3);
        assert!(three.windows(2).all(|w| w[0].id < w[1].id));
        let all_ids = srv.db.latest_telemetry(10).unwrap();
        assert_eq!(three[2].id, all_ids[9].id);

        let clamped: Vec<TelemetrySample> = srv
            .client
            .get(srv.url("/api/telemetry/latest?limit=100000"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(clamped.len(), 10);

        let none: Vec<TelemetrySample> = srv
            .client
            .get(srv.url("/api/telemetry/latest?limit=0"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_ingest_defaults_to_active_mission() {
        let srv = spawn_server(None).await;
        srv.db
            .create_mission("Planned", &MissionStatus::Planned, &MissionMode::Manual)
            .unwrap();
        let active = srv
            .db
            .create_mission("Live", &MissionStatus::Active, &MissionMode::Auto)
            .unwrap();

        srv.client
            .post(srv.url("/api/telemetry"))
            .json(&json!({ "yaw": 1.5, "leak": true }))
            .send()
            .await
            .unwrap();
        let sample = srv.db.latest_sample().unwrap().unwrap();
        assert_eq!(sample.mission_id, Some(active.id));
        assert_eq!(sample.point.yaw, Some(1.5));
        assert!(sample.point.leak);
        assert_eq!(sample.point.pitch, None);
    }

    #[tokio::test]
    async fn test_event_create_and_delete() {
        let srv = spawn_server(None).await;

        let resp = srv
            .client
            .post(srv.url("/api/events"))
            .json(&json!({ "level": "warn", "message": "Depth alarm" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let events: Vec<EventLogEntry> = resp.json().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, EventLevel::Warn);
        assert_eq!(events[0].message, "Depth alarm");

        let resp = srv
            .client
            .delete(srv.url("/api/events/9999"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        assert_eq!(srv.db.count_events().unwrap(), 1);

        let resp = srv
            .client
            .delete(srv.url(&format!("/api/events/{}", events[0].id)))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(srv.db.count_events().unwrap(), 0);

        let body: Value = srv
            .client
            .delete(srv.url("/api/events"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "deleted_all");
    }

    #[tokio::test]
    async fn test_create_event_honours_limit() {
        let srv = spawn_server(None).await;
        for i in 0..5 {
            srv.db
                .append_event(&NewEvent::info(None, format!("ping {}", i)))
                .unwrap();
        }

        let resp = srv
            .client
            .post(srv.url("/api/events?limit=2"))
            .json(&json!({ "message": "sonar contact" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let events: Vec<EventLogEntry> = resp.json().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "ping 4");
        assert_eq!(events[1].message, "sonar contact");

        let events: Vec<EventLogEntry> = srv
            .client
            .post(srv.url("/api/events?limit=9999"))
            .json(&json!({ "message": "again" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(events.len(), 7);
    }

    #[tokio::test]
    async fn test_non_integer_ids_are_not_found() {
        let srv = spawn_server(None).await;
        srv.db.append_event(&NewEvent::info(None, "keep me")).unwrap();

        for (method, path) in [
            (reqwest::Method::DELETE, "/api/events/abc"),
            (reqwest::Method::DELETE, "/api/missions/1.5"),
            (reqwest::Method::DELETE, "/api/video-clips/x"),
            (reqwest::Method::DELETE, "/api/targets/none"),
            (reqwest::Method::POST, "/api/targets/none/match"),
        ] {
            let resp = srv
                .client
                .request(method, srv.url(path))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 404, "{}", path);
            let body: ErrorResponse = resp.json().await.unwrap();
            assert_eq!(body.error, "not found");
        }
        assert_eq!(srv.db.count_events().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_panics_become_server_errors() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::new(dir.path().join("console.db")).unwrap());
        let state = WebAppState::new(
            db,
            OperatorGate::new(None, "X-Operator-Token"),
            dir.path().join("static"),
        );
        let router = with_middleware(Router::new().route("/explode", get(explode))).with_state(state);
        let base = serve(router).await;

        let resp = reqwest::get(format!("{}/explode", base)).await.unwrap();
        assert_eq!(resp.status(), 500);
        let body: ErrorResponse = resp.json().await.unwrap();
        assert_eq!(body.error, "server error");
        assert_eq!(body.detail.as_deref(), Some("reactor scram"));

        let resp = reqwest::get(format!("{}/elsewhere", base)).await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[test]
    fn test_storage_errors_map_to_status() {
        let (status, Json(body)) = db_error(DatabaseError::LockPoisoned);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "server error");
        assert_eq!(
            body.detail.as_deref(),
            Some("Database connection lock poisoned")
        );

        let (status, Json(body)) = db_error(DatabaseError::NotFound {
            entity: "event",
            id: 3,
        });
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.error, "not found");
        assert!(body.detail.is_none());
    }

    #[tokio::test]
    async fn test_failed_target_insert_removes_stored_file() {
        let srv = spawn_server(None).await;
        srv.db.execute_raw("DROP TABLE target_images").unwrap();

        let form = Form::new().part("image", Part::bytes(b"fake-png".to_vec()).file_name("wreck.png"));
        let resp = srv
            .client
            .post(srv.url("/api/targets/upload"))
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 500);
        let body: ErrorResponse = resp.json().await.unwrap();
        assert_eq!(body.error, "server error");
        assert!(body.detail.is_some());

        let leftovers = std::fs::read_dir(&srv.upload_dir).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_logs_filter_by_mission() {
        let srv = spawn_server(None).await;
        srv.db.append_event(&NewEvent::info(Some(1), "one")).unwrap();
        srv.db.append_event(&NewEvent::critical(Some(2), "two")).unwrap();
        srv.db.append_event(&NewEvent::info(None, "none")).unwrap();

        let all: Vec<Value> = srv.client.get(srv.url("/api/logs")).send().await.unwrap().json().await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].get("id").is_none());

        let two: Vec<Value> = srv
            .client
            .get(srv.url("/api/logs?mission_id=2"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(two.len(), 1);
        assert_eq!(two[0]["message"], "two");
        assert_eq!(two[0]["level"], "critical");

        let resp = srv.client.get(srv.url("/api/logs?mission_id=abc")).send().await.unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn test_video_clip_lifecycle() {
        let srv = spawn_server(None).await;

        let resp = srv
            .client
            .post(srv.url("/api/video-clips"))
            .json(&json!({ "label": "ignored" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = srv
            .client
            .post(srv.url("/api/video-clips"))
            .json(&json!({ "url": "https://example.com/a.mp4" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.unwrap();
        let id = body["id"].as_i64().unwrap();

        let clips: Vec<VideoClip> = srv.client.get(srv.url("/api/video-clips")).send().await.unwrap().json().await.unwrap();
        assert_eq!(clips.len(), 1);
        assert_eq!(clips[0].label, DEFAULT_CLIP_LABEL);

        let resp = srv
            .client
            .delete(srv.url(&format!("/api/video-clips/{}", id)))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let resp = srv
            .client
            .delete(srv.url(&format!("/api/video-clips/{}", id)))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_target_upload_match_and_delete() {
        let srv = spawn_server(None).await;

        let form = Form::new()
            .text("label", "Buoy")
            .text("mission_id", "")
            .part("image", Part::bytes(b"fake-png".to_vec()).file_name("buoy shot.png"));
        let resp = srv
            .client
            .post(srv.url("/api/targets/upload"))
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "uploaded");
        let id = body["id"].as_i64().unwrap();
        let url = body["url"].as_str().unwrap().to_string();
        assert!(url.starts_with("/static/uploads/"));
        assert!(url.ends_with("_buoy_shot.png"));

        let served = srv.client.get(srv.url(&url)).send().await.unwrap();
        assert_eq!(served.status(), 200);
        assert_eq!(served.bytes().await.unwrap().as_ref(), b"fake-png");

        let targets: Vec<TargetImage> = srv.client.get(srv.url("/api/targets")).send().await.unwrap().json().await.unwrap();
        assert_eq!(targets[0].label, "Buoy");
        assert_eq!(targets[0].status, TargetStatus::Pending);
        assert_eq!(targets[0].matched_at, None);

        for _ in 0..2 {
            let resp = srv
                .client
                .post(srv.url(&format!("/api/targets/{}/match", id)))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 200);
        }
        let target = srv.db.get_target(id).unwrap();
        assert_eq!(target.status, TargetStatus::Matched);
        assert!(target.matched_at.is_some());

        let resp = srv
            .client
            .post(srv.url("/api/targets/777/match"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = srv
            .client
            .delete(srv.url(&format!("/api/targets/{}", id)))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let gone = srv.client.get(srv.url(&url)).send().await.unwrap();
        assert_eq!(gone.status(), 404);
    }

    #[tokio::test]
    async fn test_target_upload_rejects_bad_forms() {
        let srv = spawn_server(None).await;

        let form = Form::new().text("label", "no image");
        let resp = srv.client.post(srv.url("/api/targets/upload")).multipart(form).send().await.unwrap();
        assert_eq!(resp.status(), 400);
        let body: ErrorResponse = resp.json().await.unwrap();
        assert_eq!(body.error, "missing file");

        let form = Form::new().part("image", Part::bytes(b"x".to_vec()).file_name(""));
        let resp = srv.client.post(srv.url("/api/targets/upload")).multipart(form).send().await.unwrap();
        assert_eq!(resp.status(), 400);

        let form = Form::new()
            .text("mission_id", "abc")
            .part("image", Part::bytes(b"x".to_vec()).file_name("a.png"));
        let resp = srv.client.post(srv.url("/api/targets/upload")).multipart(form).send().await.unwrap();
        assert_eq!(resp.status(), 400);

        let targets: Vec<TargetImage> = srv.client.get(srv.url("/api/targets")).send().await.unwrap().json().await.unwrap();
        assert!(targets.is_empty());
    }

    #[tokio::test]
    async fn test_autonomy_state_partial_update() {
        let srv = spawn_server(None).await;

        let state: AutonomyState = srv.client.get(srv.url("/api/auto/state")).send().await.unwrap().json().await.unwrap();
        assert_eq!(state, AutonomyState::default());
        assert!(!srv.db.has_autonomy_state().unwrap());

        let updated: AutonomyState = srv
            .client
            .post(srv.url("/api/auto/state"))
            .json(&json!({ "is_enabled": true, "note": "hold depth" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(updated.is_enabled);
        assert_eq!(updated.note, "hold depth");
        assert_eq!(updated.phase, crate::models::AutonomyPhase::Idle);

        let updated: AutonomyState = srv
            .client
            .post(srv.url("/api/auto/state"))
            .json(&json!({ "phase": "running", "note": null }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(updated.is_enabled);
        assert_eq!(updated.note, "hold depth");
        assert_eq!(updated.phase, crate::models::AutonomyPhase::Running);
        assert!(updated.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_autonomy_update_keeps_unspecified_fields() {
        let srv = spawn_server(None).await;
        srv.client
            .post(srv.url("/api/auto/state"))
            .json(&json!({ "enabled": true, "phase": "idle", "task": "survey" }))
            .send()
            .await
            .unwrap();

        let updated: AutonomyState = srv
            .client
            .post(srv.url("/api/auto/state"))
            .json(&json!({ "phase": "diving" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(updated.is_enabled);
        assert_eq!(updated.phase.as_str(), "diving");
        assert_eq!(updated.task, crate::models::AutonomyTask::Survey);
        assert_eq!(srv.db.autonomy_state().unwrap(), updated);
    }

    #[tokio::test]
    async fn test_manual_command_audit() {
        let srv = spawn_server(Some(TOKEN)).await;

        let body: Value = srv
            .client
            .post(srv.url("/api/commands/manual"))
            .header("X-Operator-Token", TOKEN)
            .json(&json!({ "command": "thrust", "value": 0.4 }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body, json!({ "status": "accepted", "command": "thrust" }));

        let body: Value = srv
            .client
            .post(srv.url("/api/commands/manual"))
            .header("X-Operator-Token", TOKEN)
            .json(&json!({ "value": 1 }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["command"], "manual");

        let commands: Vec<ManualCommand> = srv
            .client
            .get(srv.url("/api/commands/manual"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].command, "thrust");
        assert_eq!(commands[0].payload["value"], 0.4);
        assert_eq!(srv.db.count_events().unwrap(), 2);
    }

    #[test]
    fn test_limit_resolution() {
        let q = |limit| LimitQuery { limit };
        assert_eq!(q(None).resolve(50, 500), 50);
        assert_eq!(q(Some(7)).resolve(50, 500), 7);
        assert_eq!(q(Some(9000)).resolve(50, 500), 500);
        assert_eq!(q(Some(-3)).resolve(50, 500), 0);
    }
}
