//! HTTP API request handlers

use crate::app::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use execution::{items_from_agent_results, ExecutionArray, ExecutionOptions};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};
use types::{AgentResult, ExecutorError, SigningDecision, SimulationStep};
use uuid::Uuid;

pub type ApiResult = Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)>;

/// Body of `POST /sessions/:session_id/executions`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExecutionRequest {
    pub results: Vec<AgentResult>,
    #[serde(default)]
    pub options: Option<ExecutionOptions>,
    /// Annotate items with balance and simulation warnings first
    #[serde(default = "default_preflight")]
    pub preflight: bool,
}

fn default_preflight() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
pub struct RedriveRequest {
    #[serde(default)]
    pub options: Option<ExecutionOptions>,
}

#[derive(Debug, Deserialize)]
pub struct UserInputRequest {
    pub value: Value,
}

#[derive(Debug, Deserialize)]
pub struct SimulationRequest {
    pub steps: Vec<SimulationStep>,
}

fn error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": message.into() })))
}

fn executor_error(err: &ExecutorError) -> (StatusCode, Json<Value>) {
    let status = match err {
        ExecutorError::InvalidPlan(_) | ExecutorError::Config(_) => StatusCode::BAD_REQUEST,
        ExecutorError::NotFound { .. } => StatusCode::NOT_FOUND,
        ExecutorError::AlreadyExecuting { .. }
        | ExecutorError::InvalidTransition { .. }
        | ExecutorError::ItemTerminal { .. }
        | ExecutorError::State(_) => StatusCode::CONFLICT,
        ExecutorError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        ExecutorError::Transport(_)
        | ExecutorError::Chain(_)
        | ExecutorError::Fork(_)
        | ExecutorError::Signer(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error(status, err.to_string())
}

fn parse_execution_id(raw: &str) -> Result<Uuid, (StatusCode, Json<Value>)> {
    Uuid::parse_str(raw).map_err(|_| error(StatusCode::BAD_REQUEST, "Invalid execution ID format"))
}

async fn lookup(state: &AppState, raw: &str) -> Result<Arc<ExecutionArray>, (StatusCode, Json<Value>)> {
    let execution_id = parse_execution_id(raw)?;
    state
        .find_execution(&execution_id)
        .await
        .ok_or_else(|| error(StatusCode::NOT_FOUND, "Execution not found"))
}

/// Seed an execution array from planner output and start running it
pub async fn start_execution(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<StartExecutionRequest>,
) -> ApiResult {
    let mut items = items_from_agent_results(request.results)
        .map_err(|e| executor_error(&ExecutorError::from(e)))?;

    let mut preflight = Value::Null;
    if request.preflight {
        match state.validator.annotate(&mut items).await {
            Ok(report) => {
                preflight = json!({
                    "warningsAdded": report.warnings_added,
                    "simulation": report.simulation,
                });
            }
            // Warnings are advisory, the plan still runs
            Err(e) => warn!(session_id = %session_id, error = %e, "Preflight validation unavailable"),
        }
    }

    let execution_id = Uuid::new_v4();
    let array = Arc::new(ExecutionArray::new(execution_id, session_id.clone()));
    array.seed(items).map_err(|e| executor_error(&e))?;

    let session = state.session(&session_id).await;
    session.register(array.clone()).await;

    let options = request.options.unwrap_or_else(|| state.execution_options());
    info!(
        session_id = %session_id,
        execution_id = %execution_id,
        items = array.snapshot().total_items,
        "Execution accepted"
    );
    state.spawn_execution(array.clone(), options);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "executionId": execution_id,
            "sessionId": session_id,
            "state": array.snapshot(),
            "preflight": preflight,
        })),
    ))
}

/// Snapshots of every execution in a session
pub async fn list_session_executions(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult {
    let session = state.session(&session_id).await;
    let mut executions = Vec::new();
    for execution_id in session.execution_ids().await {
        if let Some(array) = session.execution(&execution_id).await {
            executions.push(array.snapshot());
        }
    }
    executions.sort_by_key(|state| state.updated_at);

    Ok((
        StatusCode::OK,
        Json(json!({
            "sessionId": session_id,
            "createdAt": session.created_at().to_rfc3339(),
            "executions": executions,
        })),
    ))
}

pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> ApiResult {
    let array = lookup(&state, &execution_id).await?;
    Ok((StatusCode::OK, Json(json!(array.snapshot()))))
}

pub async fn pause_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> ApiResult {
    set_paused(&state, &execution_id, true).await
}

pub async fn resume_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> ApiResult {
    set_paused(&state, &execution_id, false).await
}

async fn set_paused(state: &AppState, execution_id: &str, paused: bool) -> ApiResult {
    let array = lookup(state, execution_id).await?;
    array.set_paused(paused).map_err(|e| executor_error(&e))?;
    info!(execution_id = %array.execution_id(), paused, "Execution pause state changed");
    Ok((
        StatusCode::OK,
        Json(json!({ "executionId": array.execution_id(), "isPaused": paused })),
    ))
}

/// Run an idle execution again, picking up items still pending
pub async fn redrive_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
    body: Option<Json<RedriveRequest>>,
) -> ApiResult {
    let array = lookup(&state, &execution_id).await?;
    if array.is_executing() {
        return Err(executor_error(&ExecutorError::AlreadyExecuting {
            execution_id: array.execution_id().to_string(),
        }));
    }

    let options = body
        .and_then(|Json(request)| request.options)
        .unwrap_or_else(|| state.execution_options());
    state.spawn_execution(array.clone(), options);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "executionId": array.execution_id(), "state": array.snapshot() })),
    ))
}

/// Complete a user_input item with the user's value
pub async fn submit_user_input(
    State(state): State<Arc<AppState>>,
    Path((execution_id, item_id)): Path<(String, String)>,
    Json(request): Json<UserInputRequest>,
) -> ApiResult {
    let array = lookup(&state, &execution_id).await?;
    array
        .resolve_user_input(&item_id, request.value)
        .map_err(|e| executor_error(&e))?;

    Ok((StatusCode::OK, Json(json!(array.item(&item_id)))))
}

/// Dry-run one call, or several in order on a single fork
pub async fn simulate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SimulationRequest>,
) -> ApiResult {
    match request.steps.as_slice() {
        [] => Err(error(StatusCode::BAD_REQUEST, "At least one step is required")),
        [step] => {
            let result = state
                .simulator
                .simulate(&step.origin, &step.call)
                .await
                .map_err(|e| executor_error(&e))?;
            Ok((StatusCode::OK, Json(json!({ "kind": "single", "result": result }))))
        }
        steps => {
            let result = state
                .simulator
                .simulate_sequence(steps)
                .await
                .map_err(|e| executor_error(&e))?;
            Ok((StatusCode::OK, Json(json!({ "kind": "sequence", "result": result }))))
        }
    }
}

/// Signing prompts waiting for the user
pub async fn list_approvals(State(state): State<Arc<AppState>>) -> ApiResult {
    Ok((
        StatusCode::OK,
        Json(json!({ "approvals": state.approvals.pending() })),
    ))
}

pub async fn resolve_approval(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
    Json(decision): Json<SigningDecision>,
) -> ApiResult {
    let request_id = Uuid::parse_str(&request_id)
        .map_err(|_| error(StatusCode::BAD_REQUEST, "Invalid request ID format"))?;

    match state.approvals.resolve(&request_id, decision) {
        Some(delivered) => Ok((
            StatusCode::OK,
            Json(json!({ "requestId": request_id, "delivered": delivered })),
        )),
        None => Err(error(StatusCode::NOT_FOUND, "Approval request not found")),
    }
}

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> ApiResult {
    Ok((
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "components": {
                "chain": { "bestBlock": state.chain.best_number() },
                "simulator": state.simulator.name(),
            }
        })),
    ))
}

/// System status endpoint with more detailed information
pub async fn system_status(State(state): State<Arc<AppState>>) -> ApiResult {
    let sessions = state.sessions().await;
    let mut executions = 0;
    let mut running = 0;
    for session in &sessions {
        for execution_id in session.execution_ids().await {
            executions += 1;
            if let Some(array) = session.execution(&execution_id).await {
                if array.is_executing() {
                    running += 1;
                }
            }
        }
    }

    Ok((
        StatusCode::OK,
        Json(json!({
            "service": "plan-executor",
            "version": env!("CARGO_PKG_VERSION"),
            "status": "operational",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "components": {
                "sessions": {
                    "active": sessions.len(),
                    "executions": executions,
                    "running": running,
                },
                "approvals": {
                    "pending": state.approvals.len()
                },
                "configuration": {
                    "network": state.config.chain.network,
                    "signer": state.config.signer.mode,
                    "autoApprove": state.config.execution.auto_approve,
                    "allowBatching": state.config.execution.allow_batching,
                }
            }
        })),
    ))
}
