// Compute host RPC surface
//
// axum router exposing workspace lifecycle, exec, exec-stream (SSE),
// files, and the terminal WebSocket over the driver. Every request must
// carry the shared internal API key. Workspace records live in memory on
// the host; the control plane's database is the source of truth and
// reconciles against this registry.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecResults};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use base64::Engine;
use podex_core::Settings;

use crate::bandwidth::{apply_bandwidth_limit, SshTarget};
use crate::driver::ComputeDriver;
use crate::quota::{remove_workspace_directory, setup_workspace_directory};
use crate::spec::{ContainerSpec, WorkspaceStatus};

/// One workspace tracked by this host process
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceRecord {
    pub workspace_id: String,
    pub session_id: String,
    pub owner_id: String,
    pub host_id: String,
    pub container_id: String,
    pub status: WorkspaceStatus,
    pub spec: ContainerSpec,
    pub last_activity: DateTime<Utc>,
}

/// Shared state for the host server
#[derive(Clone)]
pub struct HostServerState {
    pub driver: Arc<ComputeDriver>,
    pub registry: Arc<RwLock<HashMap<String, WorkspaceRecord>>>,
    pub settings: Settings,
}

/// Build the host RPC router
pub fn router(state: HostServerState) -> Router {
    Router::new()
        .route("/workspaces", post(create_workspace))
        .route(
            "/workspaces/:id",
            get(get_workspace).delete(delete_workspace),
        )
        .route("/workspaces/:id/stop", post(stop_workspace))
        .route("/workspaces/:id/restart", post(restart_workspace))
        .route("/workspaces/:id/heartbeat", post(heartbeat))
        .route("/workspaces/:id/scale", post(scale_workspace))
        .route("/workspaces/:id/exec", post(exec_command))
        .route("/workspaces/:id/exec-stream", post(exec_stream))
        .route("/workspaces/:id/stats", get(workspace_stats))
        .route("/workspaces/:id/files", get(list_files).delete(delete_file))
        .route(
            "/workspaces/:id/files/content",
            get(read_file).put(write_file),
        )
        .route("/workspaces/:id/terminal", get(terminal_ws))
        .with_state(state)
}

fn authorized(state: &HostServerState, headers: &HeaderMap) -> bool {
    if state.settings.compute_internal_api_key.is_empty() {
        return true;
    }
    headers
        .get("X-Internal-API-Key")
        .and_then(|v| v.to_str().ok())
        .map(|key| key == state.settings.compute_internal_api_key)
        .unwrap_or(false)
}

type ApiResult<T> = std::result::Result<T, (StatusCode, Json<Value>)>;

fn api_error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (status, Json(json!({"detail": message.into()})))
}

async fn lookup(state: &HostServerState, workspace_id: &str) -> ApiResult<WorkspaceRecord> {
    state
        .registry
        .read()
        .await
        .get(workspace_id)
        .cloned()
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                format!("Workspace not found: {}", workspace_id),
            )
        })
}

// ============================================================================
// Lifecycle
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreateWorkspaceRequest {
    session_id: String,
    workspace_id: Option<String>,
    config: ContainerSpec,
}

async fn create_workspace(
    State(state): State<HostServerState>,
    headers: HeaderMap,
    Json(request): Json<CreateWorkspaceRequest>,
) -> ApiResult<Json<Value>> {
    if !authorized(&state, &headers) {
        return Err(api_error(StatusCode::UNAUTHORIZED, "Invalid API key"));
    }
    let owner_id = headers
        .get("X-User-ID")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let workspace_id = request
        .workspace_id
        .unwrap_or_else(|| format!("ws-{}", Uuid::now_v7().simple()));

    // Place on the healthy host with the fewest active workspaces
    let host_id = select_host(&state).await.ok_or_else(|| {
        api_error(StatusCode::SERVICE_UNAVAILABLE, "No healthy hosts available")
    })?;

    let mut spec = request.config;
    spec.name = format!("workspace-{}", workspace_id);
    spec.labels
        .insert("podex.workspace_id".to_string(), workspace_id.clone());
    spec.labels
        .insert("podex.disk_gib".to_string(), spec.disk_limit_gib.to_string());

    if let Some(conn) = state.driver.pool().connection(&host_id).await {
        setup_workspace_directory(&state.settings, &conn, &workspace_id, spec.disk_limit_gib).await;
        spec.volumes.insert(
            format!("{}/{}/home", state.settings.workspace_data_path, workspace_id),
            "/home/dev".to_string(),
        );
    }

    let Some(container_id) = state.driver.create_container(&host_id, &spec).await else {
        return Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to create container",
        ));
    };

    if !state.driver.start_container(&host_id, &container_id).await {
        return Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to start container",
        ));
    }

    // Egress shaping needs the container PID from inspect
    if let Ok(status) = state.driver.container_status(&host_id, &container_id).await {
        if let (Some(pid), Some(conn)) =
            (status.pid, state.driver.pool().connection(&host_id).await)
        {
            apply_bandwidth_limit(
                &state.settings,
                &conn,
                pid,
                &container_id,
                spec.bandwidth_limit_mbps,
                &SshTarget::default(),
            )
            .await;
        }
    }

    let record = WorkspaceRecord {
        workspace_id: workspace_id.clone(),
        session_id: request.session_id,
        owner_id,
        host_id,
        container_id,
        status: WorkspaceStatus::Running,
        spec,
        last_activity: Utc::now(),
    };
    state
        .registry
        .write()
        .await
        .insert(workspace_id.clone(), record.clone());

    info!(workspace_id = %workspace_id, host_id = %record.host_id, "Workspace created");
    Ok(Json(serde_json::to_value(&record).unwrap_or(Value::Null)))
}

async fn select_host(state: &HostServerState) -> Option<String> {
    let healthy = state.driver.pool().healthy_hosts().await;
    if healthy.is_empty() {
        return None;
    }
    let registry = state.registry.read().await;
    healthy
        .into_iter()
        .map(|conn| {
            let active = registry
                .values()
                .filter(|r| r.host_id == conn.host_id && r.status == WorkspaceStatus::Running)
                .count();
            (conn.host_id, active)
        })
        .min_by_key(|(_, active)| *active)
        .map(|(host_id, _)| host_id)
}

async fn get_workspace(
    State(state): State<HostServerState>,
    headers: HeaderMap,
    Path(workspace_id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !authorized(&state, &headers) {
        return Err(api_error(StatusCode::UNAUTHORIZED, "Invalid API key"));
    }
    let record = lookup(&state, &workspace_id).await?;
    Ok(Json(serde_json::to_value(&record).unwrap_or(Value::Null)))
}

async fn delete_workspace(
    State(state): State<HostServerState>,
    headers: HeaderMap,
    Path(workspace_id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !authorized(&state, &headers) {
        return Err(api_error(StatusCode::UNAUTHORIZED, "Invalid API key"));
    }
    let record = lookup(&state, &workspace_id).await?;

    state
        .driver
        .remove_container(&record.host_id, &record.container_id, true, true)
        .await;
    if let Some(conn) = state.driver.pool().connection(&record.host_id).await {
        remove_workspace_directory(&state.settings, &conn, &workspace_id).await;
    }
    state.registry.write().await.remove(&workspace_id);

    info!(workspace_id = %workspace_id, "Workspace deleted");
    Ok(Json(json!({"status": "deleted"})))
}

async fn stop_workspace(
    State(state): State<HostServerState>,
    headers: HeaderMap,
    Path(workspace_id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !authorized(&state, &headers) {
        return Err(api_error(StatusCode::UNAUTHORIZED, "Invalid API key"));
    }
    let record = lookup(&state, &workspace_id).await?;

    state
        .driver
        .stop_container(&record.host_id, &record.container_id, 10)
        .await;
    if let Some(record) = state.registry.write().await.get_mut(&workspace_id) {
        record.status = WorkspaceStatus::Standby;
    }
    Ok(Json(json!({"status": "standby"})))
}

async fn restart_workspace(
    State(state): State<HostServerState>,
    headers: HeaderMap,
    Path(workspace_id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !authorized(&state, &headers) {
        return Err(api_error(StatusCode::UNAUTHORIZED, "Invalid API key"));
    }
    let record = lookup(&state, &workspace_id).await?;

    if !state
        .driver
        .start_container(&record.host_id, &record.container_id)
        .await
    {
        return Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to start container",
        ));
    }
    if let Some(record) = state.registry.write().await.get_mut(&workspace_id) {
        record.status = WorkspaceStatus::Running;
        record.last_activity = Utc::now();
    }
    Ok(Json(json!({"status": "running"})))
}

async fn heartbeat(
    State(state): State<HostServerState>,
    headers: HeaderMap,
    Path(workspace_id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !authorized(&state, &headers) {
        return Err(api_error(StatusCode::UNAUTHORIZED, "Invalid API key"));
    }
    let mut registry = state.registry.write().await;
    match registry.get_mut(&workspace_id) {
        Some(record) => {
            record.last_activity = Utc::now();
            Ok(Json(json!({"status": "ok"})))
        }
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("Workspace not found: {}", workspace_id),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct ScaleRequest {
    new_tier: TierSpec,
}

#[derive(Debug, Deserialize)]
struct TierSpec {
    cpu_limit: Option<f64>,
    memory_limit_mib: Option<u64>,
    disk_limit_gib: Option<u64>,
}

async fn scale_workspace(
    State(state): State<HostServerState>,
    headers: HeaderMap,
    Path(workspace_id): Path<String>,
    Json(request): Json<ScaleRequest>,
) -> ApiResult<Json<Value>> {
    if !authorized(&state, &headers) {
        return Err(api_error(StatusCode::UNAUTHORIZED, "Invalid API key"));
    }
    let record = lookup(&state, &workspace_id).await?;

    let updated = state
        .driver
        .update_container(
            &record.host_id,
            &record.container_id,
            request.new_tier.cpu_limit,
            request.new_tier.memory_limit_mib,
        )
        .await;
    if !updated {
        return Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to update container limits",
        ));
    }

    if let Some(disk_gib) = request.new_tier.disk_limit_gib {
        if let Some(conn) = state.driver.pool().connection(&record.host_id).await {
            crate::quota::update_xfs_quota(&state.settings, &conn, &workspace_id, disk_gib).await;
        }
    }

    let mut registry = state.registry.write().await;
    if let Some(record) = registry.get_mut(&workspace_id) {
        if let Some(cpu) = request.new_tier.cpu_limit {
            record.spec.cpu_limit = cpu;
        }
        if let Some(mem) = request.new_tier.memory_limit_mib {
            record.spec.memory_limit_mib = mem;
        }
        if let Some(disk) = request.new_tier.disk_limit_gib {
            record.spec.disk_limit_gib = disk;
        }
    }
    Ok(Json(json!({"status": "scaled"})))
}

// ============================================================================
// Exec
// ============================================================================

#[derive(Debug, Deserialize)]
struct ExecRequest {
    command: String,
    working_dir: Option<String>,
    #[serde(default = "default_exec_timeout")]
    timeout: u64,
}

fn default_exec_timeout() -> u64 {
    60
}

async fn exec_command(
    State(state): State<HostServerState>,
    headers: HeaderMap,
    Path(workspace_id): Path<String>,
    Json(request): Json<ExecRequest>,
) -> ApiResult<Json<Value>> {
    if !authorized(&state, &headers) {
        return Err(api_error(StatusCode::UNAUTHORIZED, "Invalid API key"));
    }
    let record = lookup(&state, &workspace_id).await?;

    let result = state
        .driver
        .exec(
            &record.host_id,
            &record.container_id,
            &request.command,
            request.working_dir.as_deref(),
            request.timeout,
        )
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    if let Some(record) = state.registry.write().await.get_mut(&workspace_id) {
        record.last_activity = Utc::now();
    }

    Ok(Json(json!({
        "exit_code": result.exit_code,
        "stdout": result.stdout,
        "stderr": result.stderr,
    })))
}

/// SSE stream of command output. Newlines inside a chunk are escaped as
/// `\n`; the stream terminates with `[DONE]` and error lines are prefixed
/// `ERROR:`. Chunks are produced on line boundaries, so multi-byte UTF-8
/// never splits across frames.
async fn exec_stream(
    State(state): State<HostServerState>,
    headers: HeaderMap,
    Path(workspace_id): Path<String>,
    Json(request): Json<ExecRequest>,
) -> ApiResult<impl IntoResponse> {
    if !authorized(&state, &headers) {
        return Err(api_error(StatusCode::UNAUTHORIZED, "Invalid API key"));
    }
    let record = lookup(&state, &workspace_id).await?;

    let chunks = state
        .driver
        .exec_stream(
            &record.host_id,
            &record.container_id,
            &request.command,
            request.working_dir.as_deref(),
            request.timeout,
        )
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let events = chunks
        .map(|chunk| {
            let frame = match chunk {
                Ok(text) => text.replace('\n', "\\n"),
                Err(message) => format!("ERROR: {}", message),
            };
            Ok::<Event, Infallible>(Event::default().data(frame))
        })
        .chain(futures::stream::once(async {
            Ok(Event::default().data("[DONE]"))
        }));

    Ok(Sse::new(events))
}

async fn workspace_stats(
    State(state): State<HostServerState>,
    headers: HeaderMap,
    Path(workspace_id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !authorized(&state, &headers) {
        return Err(api_error(StatusCode::UNAUTHORIZED, "Invalid API key"));
    }
    let record = lookup(&state, &workspace_id).await?;

    let metrics = state
        .driver
        .container_stats(&record.host_id, &record.container_id)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::to_value(&metrics).unwrap_or(Value::Null)))
}

// ============================================================================
// Files
// ============================================================================

#[derive(Debug, Deserialize)]
struct PathQuery {
    path: String,
}

async fn list_files(
    State(state): State<HostServerState>,
    headers: HeaderMap,
    Path(workspace_id): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Json<Value>> {
    if !authorized(&state, &headers) {
        return Err(api_error(StatusCode::UNAUTHORIZED, "Invalid API key"));
    }
    let record = lookup(&state, &workspace_id).await?;

    let result = state
        .driver
        .exec(
            &record.host_id,
            &record.container_id,
            &format!("ls -1Ap -- {}", crate::git::escape_shell_arg(&query.path)),
            None,
            30,
        )
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    if result.exit_code != 0 {
        return Err(api_error(StatusCode::BAD_REQUEST, result.stderr));
    }

    let entries: Vec<Value> = result
        .stdout
        .lines()
        .filter(|l| !l.is_empty())
        .map(|line| {
            let is_dir = line.ends_with('/');
            json!({
                "name": line.trim_end_matches('/'),
                "is_directory": is_dir,
            })
        })
        .collect();
    Ok(Json(json!({"path": query.path, "entries": entries})))
}

async fn read_file(
    State(state): State<HostServerState>,
    headers: HeaderMap,
    Path(workspace_id): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Json<Value>> {
    if !authorized(&state, &headers) {
        return Err(api_error(StatusCode::UNAUTHORIZED, "Invalid API key"));
    }
    let record = lookup(&state, &workspace_id).await?;

    let result = state
        .driver
        .exec(
            &record.host_id,
            &record.container_id,
            &format!("cat -- {}", crate::git::escape_shell_arg(&query.path)),
            None,
            30,
        )
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    if result.exit_code != 0 {
        return Err(api_error(StatusCode::NOT_FOUND, result.stderr));
    }
    Ok(Json(json!({"path": query.path, "content": result.stdout})))
}

#[derive(Debug, Deserialize)]
struct WriteFileRequest {
    path: String,
    content: String,
}

async fn write_file(
    State(state): State<HostServerState>,
    headers: HeaderMap,
    Path(workspace_id): Path<String>,
    Json(request): Json<WriteFileRequest>,
) -> ApiResult<Json<Value>> {
    if !authorized(&state, &headers) {
        return Err(api_error(StatusCode::UNAUTHORIZED, "Invalid API key"));
    }
    let record = lookup(&state, &workspace_id).await?;

    // Content travels base64-encoded so arbitrary bytes survive the shell
    let encoded = base64::engine::general_purpose::STANDARD.encode(request.content.as_bytes());
    let escaped_path = crate::git::escape_shell_arg(&request.path);
    let command = format!(
        "mkdir -p \"$(dirname -- {path})\" && echo '{encoded}' | base64 -d > {path}",
        path = escaped_path,
        encoded = encoded,
    );

    let result = state
        .driver
        .exec(&record.host_id, &record.container_id, &command, None, 30)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    if result.exit_code != 0 {
        return Err(api_error(StatusCode::BAD_REQUEST, result.stderr));
    }
    Ok(Json(json!({"path": request.path, "written": true})))
}

async fn delete_file(
    State(state): State<HostServerState>,
    headers: HeaderMap,
    Path(workspace_id): Path<String>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Json<Value>> {
    if !authorized(&state, &headers) {
        return Err(api_error(StatusCode::UNAUTHORIZED, "Invalid API key"));
    }
    let record = lookup(&state, &workspace_id).await?;

    let result = state
        .driver
        .exec(
            &record.host_id,
            &record.container_id,
            &format!("rm -rf -- {}", crate::git::escape_shell_arg(&query.path)),
            None,
            30,
        )
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    if result.exit_code != 0 {
        return Err(api_error(StatusCode::BAD_REQUEST, result.stderr));
    }
    Ok(Json(json!({"path": query.path, "deleted": true})))
}

// ============================================================================
// Terminal WebSocket
// ============================================================================

#[derive(Debug, Deserialize)]
struct TerminalQuery {
    terminal_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum TerminalClientFrame {
    Input { data: String },
    Resize { rows: u16, cols: u16 },
    Heartbeat,
}

/// Proxy bytes between the WebSocket and a tmux session inside the
/// container. Reconnecting with the same terminal_id reattaches to the
/// existing session.
async fn terminal_ws(
    State(state): State<HostServerState>,
    headers: HeaderMap,
    Path(workspace_id): Path<String>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> ApiResult<impl IntoResponse> {
    if !authorized(&state, &headers) {
        return Err(api_error(StatusCode::UNAUTHORIZED, "Invalid API key"));
    }
    let record = lookup(&state, &workspace_id).await?;
    let terminal_id = sanitize_terminal_id(&query.terminal_id);

    Ok(ws.on_upgrade(move |socket| async move {
        if let Err(e) = run_terminal(state, record, terminal_id, socket).await {
            warn!(error = %e, "Terminal session ended with error");
        }
    }))
}

/// tmux session names must not smuggle shell syntax
fn sanitize_terminal_id(id: &str) -> String {
    id.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(64)
        .collect()
}

async fn run_terminal(
    state: HostServerState,
    record: WorkspaceRecord,
    terminal_id: String,
    socket: WebSocket,
) -> crate::error::Result<()> {
    let client = state.driver.pool().client(&record.host_id).await?;

    // -A attaches when the session already exists, so reconnects resume
    let exec = client
        .create_exec(
            &record.container_id,
            CreateExecOptions {
                cmd: Some(vec![
                    "tmux".to_string(),
                    "new-session".to_string(),
                    "-A".to_string(),
                    "-s".to_string(),
                    terminal_id.clone(),
                ]),
                attach_stdin: Some(true),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                tty: Some(true),
                user: Some("dev".to_string()),
                working_dir: Some("/home/dev".to_string()),
                ..Default::default()
            },
        )
        .await?;

    let StartExecResults::Attached {
        mut output,
        mut input,
    } = client.start_exec(&exec.id, None).await?
    else {
        return Err(crate::error::ComputeError::other("Exec did not attach"));
    };

    let (mut ws_tx, mut ws_rx) = socket.split();
    let exec_id = exec.id.clone();

    let output_task = tokio::spawn(async move {
        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(log) => {
                    let bytes = log.into_bytes();
                    let frame = json!({
                        "type": "output",
                        "data": String::from_utf8_lossy(&bytes),
                    });
                    if ws_tx
                        .send(WsMessage::Text(frame.to_string()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    let frame = json!({"type": "error", "message": e.to_string()});
                    let _ = ws_tx.send(WsMessage::Text(frame.to_string())).await;
                    break;
                }
            }
        }
    });

    while let Some(message) = ws_rx.next().await {
        let Ok(message) = message else { break };
        let WsMessage::Text(text) = message else {
            continue;
        };
        match serde_json::from_str::<TerminalClientFrame>(&text) {
            Ok(TerminalClientFrame::Input { data }) => {
                if input.write_all(data.as_bytes()).await.is_err() {
                    break;
                }
            }
            Ok(TerminalClientFrame::Resize { rows, cols }) => {
                let _ = client
                    .resize_exec(
                        &exec_id,
                        ResizeExecOptions {
                            height: rows,
                            width: cols,
                        },
                    )
                    .await;
            }
            Ok(TerminalClientFrame::Heartbeat) => {}
            Err(e) => {
                error!(error = %e, "Unparseable terminal frame");
            }
        }
    }

    output_task.abort();
    info!(terminal_id = %terminal_id, "Terminal detached");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_terminal_id() {
        assert_eq!(sanitize_terminal_id("term-1"), "term-1");
        assert_eq!(sanitize_terminal_id("a;rm -rf /"), "arm-rf");
        assert_eq!(sanitize_terminal_id("x".repeat(100).as_str()).len(), 64);
    }

    #[test]
    fn test_terminal_frame_parsing() {
        let frame: TerminalClientFrame =
            serde_json::from_str(r#"{"type":"input","data":"ls\n"}"#).unwrap();
        assert!(matches!(frame, TerminalClientFrame::Input { .. }));

        let frame: TerminalClientFrame =
            serde_json::from_str(r#"{"type":"resize","rows":40,"cols":120}"#).unwrap();
        assert!(matches!(
            frame,
            TerminalClientFrame::Resize {
                rows: 40,
                cols: 120
            }
        ));

        let frame: TerminalClientFrame = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert!(matches!(frame, TerminalClientFrame::Heartbeat));
    }

    #[test]
    fn test_exec_request_default_timeout() {
        let request: ExecRequest = serde_json::from_str(r#"{"command":"ls"}"#).unwrap();
        assert_eq!(request.timeout, 60);
    }
}
