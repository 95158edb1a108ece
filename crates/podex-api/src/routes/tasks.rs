// Task and session routes
//
// Submit/status/cancel map straight onto the orchestrator's contract;
// approval resolution passes through to the approval bus; the events
// route upgrades to a WebSocket fed by the session hub.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;

use podex_agent::{DelegateAgent, Orchestrator, TaskRequest};
use podex_core::CoreError;
use podex_storage::{Database, EncryptionService};

use crate::events::SessionEventHub;
use crate::routes::internal_error;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub hub: Arc<SessionEventHub>,
    pub db: Database,
    pub encryption: Arc<EncryptionService>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/tasks", post(create_task))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/tasks/:id/cancel", post(cancel_task))
        .route(
            "/api/agents/:agent_id/approvals/:approval_id",
            post(resolve_approval),
        )
        .route("/api/agents/:agent_id/tasks/cancel", post(cancel_agent_tasks))
        .route("/api/sessions/:id/delegate", post(delegate))
        .route("/api/sessions/:id", delete(cleanup_session))
        .route("/api/sessions/:id/events", get(session_events))
        .route("/api/users/:id/llm-keys", post(set_llm_key))
        .with_state(state)
}

/// Decrypt the user's stored provider keys into a task context map so
/// provider resolution can prefer them over platform keys
async fn inject_llm_keys(state: &AppState, context: &mut HashMap<String, Value>) {
    let Some(user_id) = context
        .get("user_id")
        .and_then(|v| v.as_str())
        .and_then(|id| id.parse().ok())
    else {
        return;
    };

    let rows = match state.db.get_user_llm_keys(user_id).await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to load user LLM keys");
            return;
        }
    };
    if rows.is_empty() {
        return;
    }

    let mut keys = serde_json::Map::new();
    for row in rows {
        match state.encryption.decrypt(&row.encrypted_key) {
            Ok(key) => {
                keys.insert(row.provider, Value::String(key));
            }
            Err(e) => {
                tracing::warn!(provider = %row.provider, error = %e, "Failed to decrypt LLM key")
            }
        }
    }
    if !keys.is_empty() {
        context.insert("llm_api_keys".to_string(), Value::Object(keys));
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateTaskRequest {
    pub session_id: String,
    pub agent_id: String,
    pub message: String,
    #[serde(default)]
    pub context: HashMap<String, Value>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TaskSubmitted {
    pub task_id: String,
}

/// Submit a task for an agent
#[utoipa::path(
    post,
    path = "/api/tasks",
    request_body = CreateTaskRequest,
    responses((status = 200, body = TaskSubmitted)),
    tag = "tasks"
)]
pub async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<Json<TaskSubmitted>, (StatusCode, Json<Value>)> {
    let mut context = request.context;
    inject_llm_keys(&state, &mut context).await;

    let task_id = state
        .orchestrator
        .submit(TaskRequest {
            session_id: request.session_id,
            agent_id: request.agent_id,
            message: request.message,
            context,
        })
        .await
        .map_err(|e| internal_error("submit task", e))?;

    Ok(Json(TaskSubmitted { task_id }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SetLlmKeyRequest {
    pub provider: String,
    pub api_key: String,
}

/// Store a user's provider API key, encrypted at rest
async fn set_llm_key(
    State(state): State<AppState>,
    Path(user_id): Path<uuid::Uuid>,
    Json(request): Json<SetLlmKeyRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let encrypted = state
        .encryption
        .encrypt(&request.api_key)
        .map_err(|e| internal_error("encrypt llm key", e))?;
    state
        .db
        .upsert_user_llm_key(user_id, &request.provider, &encrypted)
        .await
        .map_err(|e| internal_error("store llm key", e))?;

    Ok(Json(json!({"success": true, "provider": request.provider})))
}

/// Task status lookup
#[utoipa::path(
    get,
    path = "/api/tasks/{id}",
    responses((status = 200), (status = 404)),
    tag = "tasks"
)]
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.orchestrator.status(&task_id).await {
        Some(view) => Ok(Json(serde_json::to_value(&view).unwrap_or(Value::Null))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({"detail": format!("Task not found: {}", task_id)})),
        )),
    }
}

/// Cancel a pending or running task
#[utoipa::path(
    post,
    path = "/api/tasks/{id}/cancel",
    responses((status = 200), (status = 404), (status = 409)),
    tag = "tasks"
)]
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.orchestrator.cancel(&task_id).await {
        Ok(()) => Ok(Json(json!({"success": true}))),
        Err(CoreError::TaskNotFound(id)) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({"detail": format!("Task not found: {}", id)})),
        )),
        // Terminal tasks cannot be cancelled
        Err(e) => Err((
            StatusCode::CONFLICT,
            Json(json!({"success": false, "error": e.to_string()})),
        )),
    }
}

async fn cancel_agent_tasks(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Json<Value> {
    let cancelled = state.orchestrator.cancel_agent_tasks(&agent_id).await;
    Json(json!({"success": true, "cancelled": cancelled}))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResolveApprovalRequest {
    pub approved: bool,
    #[serde(default)]
    pub add_to_allowlist: bool,
}

/// Resolve a pending tool approval
#[utoipa::path(
    post,
    path = "/api/agents/{agent_id}/approvals/{approval_id}",
    request_body = ResolveApprovalRequest,
    responses((status = 200)),
    tag = "approvals"
)]
pub async fn resolve_approval(
    State(state): State<AppState>,
    Path((agent_id, approval_id)): Path<(String, String)>,
    Json(request): Json<ResolveApprovalRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let resolved = state
        .orchestrator
        .resolve_approval(
            &agent_id,
            &approval_id,
            request.approved,
            request.add_to_allowlist,
        )
        .await
        .map_err(|e| internal_error("resolve approval", e))?;

    Ok(Json(json!({"success": true, "resolved": resolved})))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DelegateRequest {
    pub description: String,
    pub agents: Vec<DelegateAgentSpec>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DelegateAgentSpec {
    pub id: String,
    pub role: String,
    pub model: String,
}

/// Fan one description out to several agents
#[utoipa::path(
    post,
    path = "/api/sessions/{id}/delegate",
    request_body = DelegateRequest,
    responses((status = 200)),
    tag = "tasks"
)]
pub async fn delegate(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<DelegateRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let agents: Vec<DelegateAgent> = request
        .agents
        .into_iter()
        .map(|a| DelegateAgent {
            id: a.id,
            role: a.role,
            model: a.model,
        })
        .collect();

    let task_ids = state
        .orchestrator
        .delegate(&session_id, &request.description, &agents)
        .await
        .map_err(|e| internal_error("delegate", e))?;

    Ok(Json(json!({"task_ids": task_ids})))
}

async fn cleanup_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<Value> {
    state.orchestrator.cleanup(&session_id).await;
    Json(json!({"success": true}))
}

/// WebSocket event channel for a session
async fn session_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let mut rx = state.hub.subscribe(&session_id);
    ws.on_upgrade(move |mut socket| async move {
        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Ok(event) => {
                            if socket
                                .send(WsMessage::Text(event.to_string()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        // Lagged subscribers skip ahead; closed hub ends
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
                message = socket.recv() => {
                    match message {
                        // Client frames (heartbeats) are ignored
                        Some(Ok(_)) => continue,
                        _ => break,
                    }
                }
            }
        }
    })
}
