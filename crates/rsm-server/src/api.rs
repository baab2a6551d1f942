//! REST surface of the coordinator.

use std::sync::atomic::Ordering;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use rsm_core::policy::Rejection;
use rsm_core::types::{AgentRecord, CommandRecord, CommandStatus};
use rsm_storage::{CommandFilter, StorageError};

use crate::queue::{CancelOutcome, SubmitError, SubmitReceipt};
use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/agents", get(list_agents))
        .route("/agents/:id", get(get_agent))
        .route("/agents/:id/commands", post(submit_command).get(agent_history))
        .route("/agents/:id/queue", get(agent_queue))
        .route("/commands", get(list_commands))
        .route("/commands/:id", get(get_command).delete(cancel_command))
        .route("/commands/bulk", post(bulk_submit))
        .route("/history/export", get(export_history))
        .route("/history/cleanup", post(cleanup_history))
        .route("/statistics", get(statistics))
        .route("/ws", get(crate::session::ws_handler))
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    Validation(Rejection),
    UnknownAgent(String),
    NotFound(String),
    AlreadyDispatched(String),
    Conflict(String),
    QueueFull { limit: usize },
    BadRequest(String),
    StoreUnavailable(String),
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(id) => ApiError::NotFound(id),
            StorageError::UnknownAgent(id) => ApiError::UnknownAgent(id),
            StorageError::DuplicateCommand(id) => ApiError::Conflict(id),
            other => ApiError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Rejected(rejection) => ApiError::Validation(rejection),
            SubmitError::QueueFull { limit } => ApiError::QueueFull { limit },
            SubmitError::Conflict(id) => ApiError::Conflict(id),
            SubmitError::Store(err) => err.into(),
            SubmitError::Unavailable => {
                ApiError::StoreUnavailable("queue engine unavailable".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Validation(rejection) => (
                StatusCode::BAD_REQUEST,
                json!({
                    "error": "validation_rejected",
                    "reason": rejection.kind(),
                    "message": rejection.to_string(),
                }),
            ),
            ApiError::UnknownAgent(id) => (
                StatusCode::NOT_FOUND,
                json!({ "error": "unknown_agent", "message": format!("unknown agent: {id}") }),
            ),
            ApiError::NotFound(id) => (
                StatusCode::NOT_FOUND,
                json!({ "error": "not_found", "message": format!("not found: {id}") }),
            ),
            ApiError::AlreadyDispatched(id) => (
                StatusCode::CONFLICT,
                json!({
                    "error": "already_dispatched",
                    "message": format!("command already dispatched: {id}"),
                }),
            ),
            ApiError::Conflict(id) => (
                StatusCode::CONFLICT,
                json!({
                    "error": "command_conflict",
                    "message": format!("duplicate command id: {id}"),
                }),
            ),
            ApiError::QueueFull { limit } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": "queue_full", "message": format!("queue full (limit {limit})") }),
            ),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "bad_request", "message": message }),
            ),
            ApiError::StoreUnavailable(message) => {
                warn!(event = "store_unavailable", error = %message);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    json!({ "error": "store_unavailable", "message": message }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "agents_online": state.engine.online_agents().await,
        "late_result_drops": state.counters.late_result_drops.load(Ordering::Relaxed),
        "frames_dropped": state.counters.frames_dropped.load(Ordering::Relaxed),
    }))
}

#[derive(Debug, Serialize)]
struct AgentView {
    #[serde(flatten)]
    record: AgentRecord,
    queued: usize,
    in_flight: usize,
}

async fn list_agents(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let agents = {
        let store = state.store.lock().await;
        store.list_agents()?
    };
    let overlay = state.engine.overlay().await;
    let views: Vec<AgentView> = agents
        .into_iter()
        .map(|record| {
            let live = overlay.get(&record.agent_id);
            AgentView {
                record,
                queued: live.map(|s| s.pending.len()).unwrap_or(0),
                in_flight: live.map(|s| s.in_flight.len()).unwrap_or(0),
            }
        })
        .collect();
    let count = views.len();
    Ok(Json(json!({ "agents": views, "count": count })))
}

async fn get_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentRecord>, ApiError> {
    let agent = {
        let store = state.store.lock().await;
        store.get_agent(&agent_id)?
    };
    agent
        .map(Json)
        .ok_or(ApiError::UnknownAgent(agent_id))
}

/// An agent is addressable if it has a configured token or has been seen
/// before. Submission to a known offline agent queues the command.
async fn require_known_agent(state: &AppState, agent_id: &str) -> Result<(), ApiError> {
    if state.tokens.contains_agent(agent_id) {
        return Ok(());
    }
    let known = {
        let store = state.store.lock().await;
        store.get_agent(agent_id)?
    };
    if known.is_some() {
        return Ok(());
    }
    Err(ApiError::UnknownAgent(agent_id.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub command: String,
    #[serde(default)]
    pub timeout: Option<u32>,
    #[serde(default)]
    pub priority: Option<i32>,
}

async fn submit_command(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitReceipt>, ApiError> {
    require_known_agent(&state, &agent_id).await?;
    let receipt = state
        .engine
        .submit(
            &agent_id,
            &request.command,
            request.timeout,
            request.priority.unwrap_or(0),
        )
        .await?;
    info!(
        event = "command_submitted",
        agent_id = %agent_id,
        command_id = %receipt.command_id
    );
    Ok(Json(receipt))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

async fn agent_history(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<CommandRecord>>, ApiError> {
    require_known_agent(&state, &agent_id).await?;
    let filter = CommandFilter {
        agent_id: Some(agent_id),
        status: parse_status(query.status.as_deref())?,
        limit: query.limit,
        offset: query.offset,
        ..CommandFilter::default()
    };
    let commands = {
        let store = state.store.lock().await;
        store.list_commands(&filter)?
    };
    Ok(Json(commands))
}

async fn agent_queue(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_known_agent(&state, &agent_id).await?;
    let snapshot = state
        .engine
        .snapshot(&agent_id)
        .await
        .ok_or_else(|| ApiError::StoreUnavailable("queue engine unavailable".to_string()))?;
    Ok(Json(json!({
        "agent_id": snapshot.agent_id,
        "online": snapshot.online,
        "queued_count": snapshot.pending.len(),
        "in_flight_count": snapshot.in_flight.len(),
        "pending": snapshot.pending,
    })))
}

#[derive(Debug, Deserialize)]
pub struct CommandsQuery {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_after: Option<String>,
    #[serde(default)]
    pub created_before: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

fn parse_status(value: Option<&str>) -> Result<Option<CommandStatus>, ApiError> {
    match value {
        None => Ok(None),
        Some(raw) => CommandStatus::parse(raw)
            .map(Some)
            .ok_or_else(|| ApiError::BadRequest(format!("invalid status: {raw}"))),
    }
}

fn parse_timestamp(value: Option<&str>) -> Result<Option<DateTime<Utc>>, ApiError> {
    match value {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|_| ApiError::BadRequest(format!("invalid timestamp: {raw}"))),
    }
}

fn filter_from_query(query: &CommandsQuery) -> Result<CommandFilter, ApiError> {
    Ok(CommandFilter {
        agent_id: query.agent_id.clone(),
        status: parse_status(query.status.as_deref())?,
        created_after: parse_timestamp(query.created_after.as_deref())?,
        created_before: parse_timestamp(query.created_before.as_deref())?,
        limit: query.limit,
        offset: query.offset,
    })
}

async fn list_commands(
    State(state): State<AppState>,
    Query(query): Query<CommandsQuery>,
) -> Result<Json<Vec<CommandRecord>>, ApiError> {
    let filter = filter_from_query(&query)?;
    let commands = {
        let store = state.store.lock().await;
        store.list_commands(&filter)?
    };
    Ok(Json(commands))
}

async fn get_command(
    State(state): State<AppState>,
    Path(command_id): Path<String>,
) -> Result<Json<CommandRecord>, ApiError> {
    let record = {
        let store = state.store.lock().await;
        store.get_command(&command_id)?
    };
    Ok(Json(record))
}

async fn cancel_command(
    State(state): State<AppState>,
    Path(command_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = {
        let store = state.store.lock().await;
        store.get_command(&command_id)?
    };
    match state.engine.cancel(&record.agent_id, &command_id).await {
        CancelOutcome::Cancelled => Ok(Json(json!({
            "command_id": command_id,
            "status": "cancelled",
        }))),
        CancelOutcome::AlreadyDispatched => Err(ApiError::AlreadyDispatched(command_id)),
        CancelOutcome::NotFound => Err(ApiError::NotFound(command_id)),
    }
}

#[derive(Debug, Deserialize)]
pub struct BulkRequest {
    pub agent_ids: Vec<String>,
    pub command: String,
    #[serde(default)]
    pub timeout: Option<u32>,
    #[serde(default)]
    pub priority: Option<i32>,
}

#[derive(Debug, Serialize)]
struct BulkEntry {
    agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    command_id: Option<String>,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn bulk_submit(
    State(state): State<AppState>,
    Json(request): Json<BulkRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if request.agent_ids.is_empty() {
        return Err(ApiError::BadRequest("agent_ids must not be empty".to_string()));
    }
    let mut results = Vec::with_capacity(request.agent_ids.len());
    for agent_id in &request.agent_ids {
        let entry = match require_known_agent(&state, agent_id).await {
            Err(_) => BulkEntry {
                agent_id: agent_id.clone(),
                command_id: None,
                status: "rejected".to_string(),
                error: Some("unknown_agent".to_string()),
            },
            Ok(()) => match state
                .engine
                .submit(
                    agent_id,
                    &request.command,
                    request.timeout,
                    request.priority.unwrap_or(0),
                )
                .await
            {
                Ok(receipt) => BulkEntry {
                    agent_id: agent_id.clone(),
                    command_id: Some(receipt.command_id),
                    status: receipt.status.to_string(),
                    error: None,
                },
                Err(err) => BulkEntry {
                    agent_id: agent_id.clone(),
                    command_id: None,
                    status: "rejected".to_string(),
                    error: Some(err.to_string()),
                },
            },
        };
        results.push(entry);
    }
    Ok(Json(json!({ "results": results })))
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

async fn export_history(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let filter = CommandFilter {
        agent_id: query.agent_id.clone(),
        status: parse_status(query.status.as_deref())?,
        limit: Some(query.limit.unwrap_or(1000)),
        ..CommandFilter::default()
    };
    let commands = {
        let store = state.store.lock().await;
        store.list_commands(&filter)?
    };
    match query.format.as_deref().unwrap_or("json") {
        "json" => Ok(Json(commands).into_response()),
        "csv" => {
            let body = export_csv(&commands);
            Ok(([(header::CONTENT_TYPE, "text/csv; charset=utf-8")], body).into_response())
        }
        other => Err(ApiError::BadRequest(format!(
            "unsupported export format: {other}"
        ))),
    }
}

const CSV_FIELDS: &[&str] = &[
    "command_id",
    "agent_id",
    "command",
    "status",
    "created_at",
    "sent_at",
    "completed_at",
    "stdout",
    "stderr",
    "exit_code",
    "execution_time",
    "error_message",
];

fn export_csv(commands: &[CommandRecord]) -> String {
    let mut out = String::new();
    out.push_str(&CSV_FIELDS.join(","));
    out.push('\n');
    for record in commands {
        let ts = |value: Option<DateTime<Utc>>| {
            value.map(|v| v.to_rfc3339()).unwrap_or_default()
        };
        let fields = [
            record.command_id.clone(),
            record.agent_id.clone(),
            record.command.clone(),
            record.status.to_string(),
            record.created_at.to_rfc3339(),
            ts(record.sent_at),
            ts(record.completed_at),
            record.stdout.clone().unwrap_or_default(),
            record.stderr.clone().unwrap_or_default(),
            record.exit_code.map(|c| c.to_string()).unwrap_or_default(),
            record
                .execution_time
                .map(|t| t.to_string())
                .unwrap_or_default(),
            record.error_message.clone().unwrap_or_default(),
        ];
        let row: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[derive(Debug, Deserialize)]
pub struct CleanupRequest {
    pub older_than_days: u32,
}

async fn cleanup_history(
    State(state): State<AppState>,
    Json(request): Json<CleanupRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let cutoff = Utc::now() - Duration::days(i64::from(request.older_than_days));
    let deleted = {
        let store = state.store.lock().await;
        store.purge_older_than(cutoff)?
    };
    info!(event = "history_cleanup", deleted, older_than_days = request.older_than_days);
    Ok(Json(json!({ "deleted": deleted })))
}

#[derive(Debug, Deserialize)]
pub struct StatisticsQuery {
    #[serde(default)]
    pub agent_id: Option<String>,
}

async fn statistics(
    State(state): State<AppState>,
    Query(query): Query<StatisticsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = {
        let store = state.store.lock().await;
        store.statistics(query.agent_id.as_deref())?
    };
    Ok(Json(json!({
        "statistics": stats,
        "late_result_drops": state.counters.late_result_drops.load(Ordering::Relaxed),
        "frames_dropped": state.counters.frames_dropped.load(Ordering::Relaxed),
    })))
}
