// Remote tool backend
//
// Maps workspace tool names from the agent's executor onto Compute Client
// calls so file, command, and git tools run inside the workspace
// container. Unknown names report a structured failure, mirroring the
// executor's result contract.

use async_trait::async_trait;
use serde_json::{json, Value};

use podex_agent::RemoteToolBackend;
use podex_core::Result;

use crate::client::ComputeClient;
use crate::git;

/// Compute-backed implementation of the executor's remote seam
pub struct ComputeToolBackend {
    client: ComputeClient,
}

impl ComputeToolBackend {
    pub fn new(client: ComputeClient) -> Self {
        Self { client }
    }

    fn arg<'a>(arguments: &'a Value, key: &str) -> &'a str {
        arguments.get(key).and_then(|v| v.as_str()).unwrap_or("")
    }
}

#[async_trait]
impl RemoteToolBackend for ComputeToolBackend {
    async fn execute(
        &self,
        workspace_id: &str,
        user_id: &str,
        tool_name: &str,
        arguments: &Value,
    ) -> Result<Value> {
        let result = match tool_name {
            "read_file" => {
                let path = Self::arg(arguments, "path");
                match self.client.read_file(workspace_id, user_id, path).await {
                    Ok(content) => json!({"success": true, "path": path, "content": content}),
                    Err(e) => json!({"success": false, "error": e.to_string()}),
                }
            }
            "write_file" => {
                let path = Self::arg(arguments, "path");
                let content = Self::arg(arguments, "content");
                match self
                    .client
                    .write_file(workspace_id, user_id, path, content)
                    .await
                {
                    Ok(()) => json!({"success": true, "path": path, "bytes": content.len()}),
                    Err(e) => json!({"success": false, "error": e.to_string()}),
                }
            }
            "list_directory" => {
                let path = arguments
                    .get("path")
                    .and_then(|v| v.as_str())
                    .unwrap_or(".");
                match self.client.list_files(workspace_id, user_id, path).await {
                    Ok(listing) => json!({"success": true, "listing": listing}),
                    Err(e) => json!({"success": false, "error": e.to_string()}),
                }
            }
            "run_command" => {
                let command = Self::arg(arguments, "command");
                let cwd = arguments.get("cwd").and_then(|v| v.as_str());
                let timeout = arguments
                    .get("timeout")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(60);
                match self
                    .client
                    .exec_command(workspace_id, user_id, command, cwd, timeout)
                    .await
                {
                    Ok(result) => json!({
                        "success": result.exit_code == 0,
                        "exit_code": result.exit_code,
                        "stdout": result.stdout,
                        "stderr": result.stderr,
                    }),
                    Err(e) => json!({"success": false, "error": e.to_string()}),
                }
            }
            "search_code" | "grep" => {
                let pattern = Self::arg(arguments, "pattern");
                let query = Self::arg(arguments, "query");
                let needle = if pattern.is_empty() { query } else { pattern };
                let path = arguments
                    .get("path")
                    .and_then(|v| v.as_str())
                    .unwrap_or(".");
                let command = format!(
                    "grep -rn --max-count=50 -- {} {}",
                    git::escape_shell_arg(needle),
                    git::escape_shell_arg(path)
                );
                match self
                    .client
                    .exec_command(workspace_id, user_id, &command, None, 30)
                    .await
                {
                    Ok(result) => json!({
                        "success": true,
                        "matches": result.stdout.lines().collect::<Vec<_>>(),
                    }),
                    Err(e) => json!({"success": false, "error": e.to_string()}),
                }
            }
            "glob_files" => {
                let pattern = Self::arg(arguments, "pattern");
                let path = arguments
                    .get("path")
                    .and_then(|v| v.as_str())
                    .unwrap_or(".");
                let command = format!(
                    "find {} -name {} -not -path '*/.git/*'",
                    git::escape_shell_arg(path),
                    git::escape_shell_arg(pattern)
                );
                match self
                    .client
                    .exec_command(workspace_id, user_id, &command, None, 30)
                    .await
                {
                    Ok(result) => json!({
                        "success": true,
                        "files": result.stdout.lines().collect::<Vec<_>>(),
                    }),
                    Err(e) => json!({"success": false, "error": e.to_string()}),
                }
            }
            "apply_patch" => {
                let path = Self::arg(arguments, "path");
                let patch = Self::arg(arguments, "patch");
                // Write the patch to a temp file, apply, clean up
                let patch_path = format!("/tmp/.podex-patch-{}", uuid::Uuid::now_v7().simple());
                if let Err(e) = self
                    .client
                    .write_file(workspace_id, user_id, &patch_path, patch)
                    .await
                {
                    return Ok(json!({"success": false, "error": e.to_string()}));
                }
                let command = format!(
                    "patch {} < {} && rm -f {}",
                    git::escape_shell_arg(path),
                    git::escape_shell_arg(&patch_path),
                    git::escape_shell_arg(&patch_path)
                );
                match self
                    .client
                    .exec_command(workspace_id, user_id, &command, None, 30)
                    .await
                {
                    Ok(result) => json!({
                        "success": result.exit_code == 0,
                        "stdout": result.stdout,
                        "stderr": result.stderr,
                    }),
                    Err(e) => json!({"success": false, "error": e.to_string()}),
                }
            }
            "delete_file" => {
                let path = Self::arg(arguments, "path");
                match self.client.delete_file(workspace_id, user_id, path).await {
                    Ok(()) => json!({"success": true, "path": path}),
                    Err(e) => json!({"success": false, "error": e.to_string()}),
                }
            }
            "git_status" => {
                let handle = self.client.workspace(workspace_id, user_id);
                match git::status(&handle).await {
                    Ok(status) => {
                        json!({"success": true, "status": serde_json::to_value(&status).unwrap_or(Value::Null)})
                    }
                    Err(e) => json!({"success": false, "error": e.to_string()}),
                }
            }
            "git_log" => {
                let handle = self.client.workspace(workspace_id, user_id);
                let limit = arguments
                    .get("limit")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(10) as u32;
                match git::log(&handle, limit).await {
                    Ok(commits) => {
                        json!({"success": true, "commits": serde_json::to_value(&commits).unwrap_or(Value::Null)})
                    }
                    Err(e) => json!({"success": false, "error": e.to_string()}),
                }
            }
            "git_diff" => {
                let handle = self.client.workspace(workspace_id, user_id);
                let staged = arguments
                    .get("staged")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                match git::diff(&handle, staged).await {
                    Ok(files) => json!({"success": true, "files": serde_json::to_value(&files).unwrap_or(Value::Null)}),
                    Err(e) => json!({"success": false, "error": e.to_string()}),
                }
            }
            "git_branch" => {
                let handle = self.client.workspace(workspace_id, user_id);
                match arguments.get("action").and_then(|v| v.as_str()) {
                    Some("create") => {
                        let name = Self::arg(arguments, "name");
                        match git::checkout(&handle, name, true).await {
                            Ok(result) => json!({"success": result.exit_code == 0, "branch": name}),
                            Err(e) => json!({"success": false, "error": e.to_string()}),
                        }
                    }
                    Some("checkout") => {
                        let name = Self::arg(arguments, "name");
                        match git::checkout(&handle, name, false).await {
                            Ok(result) => json!({"success": result.exit_code == 0, "branch": name}),
                            Err(e) => json!({"success": false, "error": e.to_string()}),
                        }
                    }
                    _ => match git::branches(&handle).await {
                        Ok(branches) => {
                            json!({"success": true, "branches": serde_json::to_value(&branches).unwrap_or(Value::Null)})
                        }
                        Err(e) => json!({"success": false, "error": e.to_string()}),
                    },
                }
            }
            "git_commit" => {
                let handle = self.client.workspace(workspace_id, user_id);
                let message = Self::arg(arguments, "message");
                if let Some(files) = arguments.get("files").and_then(|v| v.as_array()) {
                    let files: Vec<String> = files
                        .iter()
                        .filter_map(|f| f.as_str().map(|s| s.to_string()))
                        .collect();
                    if let Err(e) = git::stage(&handle, &files).await {
                        return Ok(json!({"success": false, "error": e.to_string()}));
                    }
                }
                match git::commit(&handle, message).await {
                    Ok(Some(hash)) => json!({"success": true, "commit_hash": hash}),
                    Ok(None) => json!({"success": false, "error": "Nothing committed"}),
                    Err(e) => json!({"success": false, "error": e.to_string()}),
                }
            }
            "git_push" => {
                let handle = self.client.workspace(workspace_id, user_id);
                let remote = arguments
                    .get("remote")
                    .and_then(|v| v.as_str())
                    .unwrap_or("origin");
                let branch = arguments.get("branch").and_then(|v| v.as_str());
                let force = arguments
                    .get("force")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let set_upstream = arguments
                    .get("set_upstream")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                match git::push(&handle, remote, branch, force, set_upstream).await {
                    Ok(result) => json!({
                        "success": result.exit_code == 0,
                        "output": result.stderr,
                    }),
                    Err(e) => json!({"success": false, "error": e.to_string()}),
                }
            }
            other => json!({"success": false, "error": format!("Unknown workspace tool: {}", other)}),
        };

        Ok(result)
    }
}
