// Compute service HTTP client
//
// JSON over HTTP to the compute host, authenticated with the shared
// internal API key; user-scoped requests also carry X-User-ID. A 404 for
// a known workspace maps to WorkspaceNotFound, which reconcilers treat as
// "the host forgot the workspace" rather than a failure.

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{ComputeError, Result};
use crate::git::WorkspaceExec;
use crate::spec::ExecResult;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const CREATE_TIMEOUT: Duration = Duration::from_secs(600);

/// Client for the compute host RPC surface
#[derive(Clone)]
pub struct ComputeClient {
    base_url: String,
    internal_api_key: String,
    client: Client,
}

impl ComputeClient {
    pub fn new(base_url: impl Into<String>, internal_api_key: impl Into<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into(),
            internal_api_key: internal_api_key.into(),
            client,
        }
    }

    fn request(&self, method: Method, path: &str, user_id: Option<&str>) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header("X-Internal-API-Key", &self.internal_api_key)
            .timeout(DEFAULT_TIMEOUT);
        if let Some(user_id) = user_id {
            builder = builder.header("X-User-ID", user_id);
        }
        builder
    }

    async fn handle(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ComputeError::WorkspaceNotFound(
                response.text().await.unwrap_or_default(),
            ));
        }
        if !status.is_success() {
            return Err(ComputeError::Http {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        response
            .json()
            .await
            .map_err(|e| ComputeError::Connection(e.to_string()))
    }

    // ==================== Workspace lifecycle ====================

    /// Create a workspace. Container pulls can be slow, so this call gets
    /// a 10-minute deadline.
    pub async fn create_workspace(
        &self,
        session_id: &str,
        user_id: &str,
        workspace_id: Option<&str>,
        config: &Value,
    ) -> Result<Value> {
        let response = self
            .request(Method::POST, "/workspaces", Some(user_id))
            .timeout(CREATE_TIMEOUT)
            .json(&json!({
                "session_id": session_id,
                "workspace_id": workspace_id,
                "config": config,
            }))
            .send()
            .await
            .map_err(|e| ComputeError::Connection(e.to_string()))?;
        Self::handle(response).await
    }

    pub async fn get_workspace(&self, workspace_id: &str, user_id: &str) -> Result<Value> {
        let response = self
            .request(
                Method::GET,
                &format!("/workspaces/{}", workspace_id),
                Some(user_id),
            )
            .send()
            .await
            .map_err(|e| ComputeError::Connection(e.to_string()))?;
        Self::handle(response).await
    }

    pub async fn stop_workspace(&self, workspace_id: &str, user_id: &str) -> Result<()> {
        let response = self
            .request(
                Method::POST,
                &format!("/workspaces/{}/stop", workspace_id),
                Some(user_id),
            )
            .send()
            .await
            .map_err(|e| ComputeError::Connection(e.to_string()))?;
        Self::handle(response).await.map(|_| ())
    }

    pub async fn restart_workspace(&self, workspace_id: &str, user_id: &str) -> Result<Value> {
        let response = self
            .request(
                Method::POST,
                &format!("/workspaces/{}/restart", workspace_id),
                Some(user_id),
            )
            .send()
            .await
            .map_err(|e| ComputeError::Connection(e.to_string()))?;
        Self::handle(response).await
    }

    pub async fn delete_workspace(&self, workspace_id: &str, user_id: &str) -> Result<()> {
        let response = self
            .request(
                Method::DELETE,
                &format!("/workspaces/{}", workspace_id),
                Some(user_id),
            )
            .send()
            .await
            .map_err(|e| ComputeError::Connection(e.to_string()))?;
        Self::handle(response).await.map(|_| ())
    }

    pub async fn heartbeat(&self, workspace_id: &str, user_id: &str) -> Result<()> {
        let response = self
            .request(
                Method::POST,
                &format!("/workspaces/{}/heartbeat", workspace_id),
                Some(user_id),
            )
            .send()
            .await
            .map_err(|e| ComputeError::Connection(e.to_string()))?;
        Self::handle(response).await.map(|_| ())
    }

    pub async fn scale_workspace(
        &self,
        workspace_id: &str,
        user_id: &str,
        new_tier: &Value,
    ) -> Result<Value> {
        let response = self
            .request(
                Method::POST,
                &format!("/workspaces/{}/scale", workspace_id),
                Some(user_id),
            )
            .json(&json!({"new_tier": new_tier}))
            .send()
            .await
            .map_err(|e| ComputeError::Connection(e.to_string()))?;
        Self::handle(response).await
    }

    /// Lightweight liveness probe: a remote echo with a short deadline
    pub async fn health_check_workspace(
        &self,
        workspace_id: &str,
        user_id: &str,
        timeout_s: u64,
    ) -> Result<bool> {
        match self
            .exec_command(workspace_id, user_id, "echo healthy", None, timeout_s)
            .await
        {
            Ok(result) => Ok(result.exit_code == 0 && result.stdout.contains("healthy")),
            Err(e) if e.is_not_found() => Err(e),
            Err(e) => {
                warn!(workspace_id = %workspace_id, error = %e, "Health check failed");
                Ok(false)
            }
        }
    }

    // ==================== Files ====================

    pub async fn list_files(
        &self,
        workspace_id: &str,
        user_id: &str,
        path: &str,
    ) -> Result<Value> {
        let response = self
            .request(
                Method::GET,
                &format!("/workspaces/{}/files", workspace_id),
                Some(user_id),
            )
            .query(&[("path", path)])
            .send()
            .await
            .map_err(|e| ComputeError::Connection(e.to_string()))?;
        Self::handle(response).await
    }

    pub async fn read_file(
        &self,
        workspace_id: &str,
        user_id: &str,
        path: &str,
    ) -> Result<String> {
        let response = self
            .request(
                Method::GET,
                &format!("/workspaces/{}/files/content", workspace_id),
                Some(user_id),
            )
            .query(&[("path", path)])
            .send()
            .await
            .map_err(|e| ComputeError::Connection(e.to_string()))?;
        let value = Self::handle(response).await?;
        Ok(value
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string())
    }

    pub async fn write_file(
        &self,
        workspace_id: &str,
        user_id: &str,
        path: &str,
        content: &str,
    ) -> Result<()> {
        let response = self
            .request(
                Method::PUT,
                &format!("/workspaces/{}/files/content", workspace_id),
                Some(user_id),
            )
            .json(&json!({"path": path, "content": content}))
            .send()
            .await
            .map_err(|e| ComputeError::Connection(e.to_string()))?;
        Self::handle(response).await.map(|_| ())
    }

    pub async fn delete_file(&self, workspace_id: &str, user_id: &str, path: &str) -> Result<()> {
        let response = self
            .request(
                Method::DELETE,
                &format!("/workspaces/{}/files", workspace_id),
                Some(user_id),
            )
            .query(&[("path", path)])
            .send()
            .await
            .map_err(|e| ComputeError::Connection(e.to_string()))?;
        Self::handle(response).await.map(|_| ())
    }

    // ==================== Command execution ====================

    /// Execute a command in the workspace. The HTTP read deadline is the
    /// exec timeout plus a 30-second network buffer; an HTTP-level timeout
    /// becomes a synthetic exit -1 result rather than an error.
    pub async fn exec_command(
        &self,
        workspace_id: &str,
        user_id: &str,
        command: &str,
        working_dir: Option<&str>,
        timeout_s: u64,
    ) -> Result<ExecResult> {
        let http_timeout = Duration::from_secs((timeout_s + 30).max(60));

        debug!(
            workspace_id = %workspace_id,
            command = %&command[..command.len().min(100)],
            timeout_s = timeout_s,
            "Executing command in workspace"
        );

        let response = self
            .request(
                Method::POST,
                &format!("/workspaces/{}/exec", workspace_id),
                Some(user_id),
            )
            .timeout(http_timeout)
            .json(&json!({
                "command": command,
                "working_dir": working_dir,
                "timeout": timeout_s,
            }))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Ok(ExecResult {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: format!("Command timed out after {} seconds", timeout_s),
                });
            }
            Err(e) => return Err(ComputeError::Connection(e.to_string())),
        };

        let value = Self::handle(response).await?;
        let parsed: ExecResponse =
            serde_json::from_value(value).map_err(|e| ComputeError::Connection(e.to_string()))?;
        Ok(ExecResult {
            exit_code: parsed.exit_code,
            stdout: parsed.stdout,
            stderr: parsed.stderr,
        })
    }

    /// Execute a command and stream output chunks over SSE.
    ///
    /// The server escapes newlines inside a chunk as `\n`; they are
    /// restored here. The stream ends at `[DONE]`; `ERROR:`-prefixed
    /// frames are yielded and terminate the stream.
    pub async fn exec_command_stream(
        &self,
        workspace_id: &str,
        user_id: &str,
        command: &str,
        working_dir: Option<&str>,
        timeout_s: u64,
    ) -> Result<BoxStream<'static, String>> {
        let http_timeout = Duration::from_secs((timeout_s + 30).max(60));

        let response = self
            .request(
                Method::POST,
                &format!("/workspaces/{}/exec-stream", workspace_id),
                Some(user_id),
            )
            .timeout(http_timeout)
            .json(&json!({
                "command": command,
                "working_dir": working_dir,
                "timeout": timeout_s,
            }))
            .send()
            .await
            .map_err(|e| ComputeError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ComputeError::Http {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let events = response.bytes_stream().eventsource();
        let stream = events
            .take_while(|event| {
                let done = matches!(event, Ok(e) if e.data == "[DONE]");
                futures::future::ready(!done)
            })
            .filter_map(|event| async move {
                match event {
                    Ok(event) if event.data.starts_with("ERROR:") => Some(event.data),
                    Ok(event) => Some(event.data.replace("\\n", "\n")),
                    Err(e) => Some(format!("ERROR: stream failure: {}", e)),
                }
            })
            .boxed();

        Ok(stream)
    }

    /// Per-workspace handle implementing the git exec seam
    pub fn workspace(&self, workspace_id: &str, user_id: &str) -> WorkspaceHandle {
        WorkspaceHandle {
            client: self.clone(),
            workspace_id: workspace_id.to_string(),
            user_id: user_id.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExecResponse {
    exit_code: i64,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

/// A workspace-scoped view of the client, usable by the git surface
#[derive(Clone)]
pub struct WorkspaceHandle {
    client: ComputeClient,
    workspace_id: String,
    user_id: String,
}

#[async_trait::async_trait]
impl WorkspaceExec for WorkspaceHandle {
    async fn exec(
        &self,
        command: &str,
        working_dir: Option<&str>,
        timeout_s: u64,
    ) -> Result<ExecResult> {
        self.client
            .exec_command(
                &self.workspace_id,
                &self.user_id,
                command,
                working_dir,
                timeout_s,
            )
            .await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> ComputeClient {
        ComputeClient::new(server.uri(), "internal-secret")
    }

    #[tokio::test]
    async fn test_exec_command_roundtrip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/workspaces/ws-1/exec"))
            .and(header("X-Internal-API-Key", "internal-secret"))
            .and(header("X-User-ID", "user-1"))
            .and(body_partial_json(json!({"command": "ls -la", "timeout": 30})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "exit_code": 0,
                "stdout": "total 0\n",
                "stderr": ""
            })))
            .mount(&server)
            .await;

        let result = client(&server)
            .exec_command("ws-1", "user-1", "ls -la", None, 30)
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "total 0\n");
    }

    #[tokio::test]
    async fn test_exec_timeout_is_passed_through() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/workspaces/ws-1/exec"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "exit_code": 124,
                "stdout": "",
                "stderr": "Command timed out"
            })))
            .mount(&server)
            .await;

        let result = client(&server)
            .exec_command("ws-1", "user-1", "sleep 999", None, 5)
            .await
            .unwrap();
        assert_eq!(result.exit_code, 124);
    }

    #[tokio::test]
    async fn test_404_maps_to_workspace_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/workspaces/ws-gone"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such workspace"))
            .mount(&server)
            .await;

        let err = client(&server)
            .get_workspace("ws-gone", "user-1")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_exec_stream_unescapes_and_stops_at_done() {
        let server = MockServer::start().await;
        let body = "data: line one\\nline two\n\ndata: third\n\ndata: [DONE]\n\ndata: after\n\n";
        Mock::given(method("POST"))
            .and(path("/workspaces/ws-1/exec-stream"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let stream = client(&server)
            .exec_command_stream("ws-1", "user-1", "make build", None, 30)
            .await
            .unwrap();
        let chunks: Vec<String> = stream.collect().await;

        assert_eq!(chunks, vec!["line one\nline two".to_string(), "third".to_string()]);
    }

    #[tokio::test]
    async fn test_exec_stream_error_frames_pass_through() {
        let server = MockServer::start().await;
        let body = "data: ok\n\ndata: ERROR: boom\n\ndata: [DONE]\n\n";
        Mock::given(method("POST"))
            .and(path("/workspaces/ws-1/exec-stream"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let stream = client(&server)
            .exec_command_stream("ws-1", "user-1", "false", None, 30)
            .await
            .unwrap();
        let chunks: Vec<String> = stream.collect().await;
        assert_eq!(chunks, vec!["ok".to_string(), "ERROR: boom".to_string()]);
    }

    #[tokio::test]
    async fn test_health_check_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/workspaces/ws-1/exec"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "exit_code": 0,
                "stdout": "healthy\n",
                "stderr": ""
            })))
            .mount(&server)
            .await;

        assert!(client(&server)
            .health_check_workspace("ws-1", "user-1", 5)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_git_status_through_workspace_handle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/workspaces/ws-1/exec"))
            .and(body_partial_json(json!({"command": "git status --porcelain -b"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "exit_code": 0,
                "stdout": "## main...origin/main [ahead 1]\nM  src/lib.rs\n",
                "stderr": ""
            })))
            .mount(&server)
            .await;

        let handle = client(&server).workspace("ws-1", "user-1");
        let status = crate::git::status(&handle).await.unwrap();
        assert_eq!(status.branch, "main");
        assert_eq!(status.ahead, 1);
        assert_eq!(status.staged.len(), 1);
    }
}
