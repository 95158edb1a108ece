// Multi-host container driver
//
// Creates, starts, stops, removes, execs into, and resource-limits
// workspace containers on a chosen host. Container create failures are
// logged and reported as None so callers degrade instead of crashing.

use std::collections::HashMap;
use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    StatsOptions, StopContainerOptions, UpdateContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{DeviceRequest, HostConfig, PortBinding};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use podex_core::Settings;

use crate::error::{ComputeError, Result};
use crate::pool::SharedHostPool;
use crate::spec::{ContainerSpec, ExecResult};
use crate::stats::{discover_gpu, parse_container_stats, ContainerMetrics, ServerStats};

/// Label every workspace container carries, used for capacity accounting
pub const WORKSPACE_LABEL: &str = "podex.workspace";

const DEFAULT_EXEC_USER: &str = "dev";
const DEFAULT_WORKDIR: &str = "/home/dev";

/// Summary of a container on a host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub status: String,
    pub labels: HashMap<String, String>,
}

/// Inspect-level status for one container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub id: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub pid: Option<i64>,
}

/// Driver over the host pool
pub struct ComputeDriver {
    pool: SharedHostPool,
    settings: Settings,
}

impl ComputeDriver {
    pub fn new(pool: SharedHostPool, settings: Settings) -> Self {
        Self { pool, settings }
    }

    pub fn pool(&self) -> &SharedHostPool {
        &self.pool
    }

    /// Pick the image variant for a spec on a host. GPU workspaces always
    /// run the x86_64 image.
    fn select_image(&self, spec: &ContainerSpec, architecture: &str) -> String {
        if spec.gpu.enabled {
            return self.settings.workspace_image_amd64.clone();
        }
        match architecture {
            "arm64" => self.settings.workspace_image_arm64.clone(),
            "amd64" => self.settings.workspace_image_amd64.clone(),
            _ => spec.image.clone(),
        }
    }

    /// Create a container on a host. Returns the container id, or None
    /// when creation fails (the failure is logged).
    pub async fn create_container(&self, host_id: &str, spec: &ContainerSpec) -> Option<String> {
        let client = match self.pool.client(host_id).await {
            Ok(client) => client,
            Err(e) => {
                error!(host_id = %host_id, error = %e, "No client available for host");
                return None;
            }
        };
        let conn = self.pool.connection(host_id).await?;

        let image = self.select_image(spec, &conn.architecture);

        let mut env: HashMap<String, String> = spec.environment.clone();
        let mut host_config = HostConfig {
            nano_cpus: Some(spec.nano_cpus()),
            memory: Some(spec.memory_bytes()),
            binds: if spec.volumes.is_empty() {
                None
            } else {
                Some(
                    spec.volumes
                        .iter()
                        .map(|(host, container)| format!("{}:{}", host, container))
                        .collect(),
                )
            },
            network_mode: spec.network.clone(),
            ..Default::default()
        };

        if spec.gpu.enabled {
            // NVIDIA runtime with an explicit device request; count 0
            // means every GPU on the host
            host_config.runtime = Some("nvidia".to_string());
            let count = if spec.gpu.count == 0 {
                -1
            } else {
                spec.gpu.count as i64
            };
            host_config.device_requests = Some(vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                count: Some(count),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]);
            env.entry("NVIDIA_VISIBLE_DEVICES".to_string())
                .or_insert_with(|| "all".to_string());
            env.entry("NVIDIA_DRIVER_CAPABILITIES".to_string())
                .or_insert_with(|| "compute,utility".to_string());
            info!(
                container_name = %spec.name,
                gpu_count = count,
                gpu_type = ?spec.gpu.gpu_type,
                "Configuring GPU container"
            );
        } else if let Some(runtime) = &spec.runtime {
            host_config.runtime = Some(runtime.clone());
        }

        if !spec.ports.is_empty() {
            let mut bindings = HashMap::new();
            for (container_port, host_port) in &spec.ports {
                bindings.insert(
                    container_port.clone(),
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: host_port.map(|p| p.to_string()),
                    }]),
                );
            }
            host_config.port_bindings = Some(bindings);
        }

        let mut labels = spec.labels.clone();
        labels.insert(WORKSPACE_LABEL.to_string(), "true".to_string());

        let config = Config {
            image: Some(image),
            env: Some(env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        match client.create_container(Some(options), config).await {
            Ok(response) => {
                info!(
                    host_id = %host_id,
                    container_name = %spec.name,
                    container_id = %short_id(&response.id),
                    "Created container"
                );
                Some(response.id)
            }
            Err(e) => {
                error!(
                    host_id = %host_id,
                    container_name = %spec.name,
                    error = %e,
                    "Failed to create container"
                );
                None
            }
        }
    }

    pub async fn start_container(&self, host_id: &str, container_id: &str) -> bool {
        let Ok(client) = self.pool.client(host_id).await else {
            return false;
        };
        match client
            .start_container::<String>(container_id, None)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!(
                    host_id = %host_id,
                    container_id = %short_id(container_id),
                    error = %e,
                    "Failed to start container"
                );
                false
            }
        }
    }

    pub async fn stop_container(&self, host_id: &str, container_id: &str, timeout_s: i64) -> bool {
        let Ok(client) = self.pool.client(host_id).await else {
            return false;
        };
        match client
            .stop_container(container_id, Some(StopContainerOptions { t: timeout_s }))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!(
                    host_id = %host_id,
                    container_id = %short_id(container_id),
                    error = %e,
                    "Failed to stop container"
                );
                false
            }
        }
    }

    pub async fn remove_container(
        &self,
        host_id: &str,
        container_id: &str,
        force: bool,
        remove_volumes: bool,
    ) -> bool {
        let Ok(client) = self.pool.client(host_id).await else {
            return false;
        };
        match client
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force,
                    v: remove_volumes,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!(
                    host_id = %host_id,
                    container_id = %short_id(container_id),
                    error = %e,
                    "Failed to remove container"
                );
                false
            }
        }
    }

    /// Live resource-limit update, no restart
    pub async fn update_container(
        &self,
        host_id: &str,
        container_id: &str,
        cpu_limit: Option<f64>,
        memory_limit_mib: Option<u64>,
    ) -> bool {
        let Ok(client) = self.pool.client(host_id).await else {
            return false;
        };

        let options = UpdateContainerOptions::<String> {
            nano_cpus: cpu_limit.map(|cpus| (cpus * 1e9) as i64),
            memory: memory_limit_mib.map(|mib| (mib as i64) * 1024 * 1024),
            ..Default::default()
        };

        match client.update_container(container_id, options).await {
            Ok(_) => {
                info!(
                    host_id = %host_id,
                    container_id = %short_id(container_id),
                    cpu_limit = ?cpu_limit,
                    memory_limit_mib = ?memory_limit_mib,
                    "Updated container resources"
                );
                true
            }
            Err(e) => {
                error!(
                    host_id = %host_id,
                    container_id = %short_id(container_id),
                    error = %e,
                    "Failed to update container"
                );
                false
            }
        }
    }

    /// Run a command in a container with a deadline. A timeout returns
    /// exit code 124 with an explicit message.
    pub async fn exec(
        &self,
        host_id: &str,
        container_id: &str,
        command: &str,
        working_dir: Option<&str>,
        timeout_s: u64,
    ) -> Result<ExecResult> {
        let client = self.pool.client(host_id).await?;

        let exec = client
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(vec!["bash".to_string(), "-c".to_string(), command.to_string()]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(working_dir.unwrap_or(DEFAULT_WORKDIR).to_string()),
                    user: Some(DEFAULT_EXEC_USER.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        let run = async {
            let mut stdout = String::new();
            let mut stderr = String::new();

            if let StartExecResults::Attached { mut output, .. } =
                client.start_exec(&exec.id, None).await?
            {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "Exec output stream error");
                            break;
                        }
                    }
                }
            }

            let inspect = client.inspect_exec(&exec.id).await?;
            Ok::<ExecResult, ComputeError>(ExecResult {
                exit_code: inspect.exit_code.unwrap_or(-1),
                stdout,
                stderr,
            })
        };

        match tokio::time::timeout(Duration::from_secs(timeout_s), run).await {
            Ok(result) => result,
            Err(_) => Ok(ExecResult {
                exit_code: 124,
                stdout: String::new(),
                stderr: format!("Command timed out after {} seconds", timeout_s),
            }),
        }
    }

    /// Run a command and stream its output as it is produced. Chunks are
    /// split on line boundaries so a UTF-8 sequence never straddles two
    /// chunks. The stream ends when the command exits or the deadline
    /// passes; a deadline overrun yields a final timeout error chunk.
    pub async fn exec_stream(
        &self,
        host_id: &str,
        container_id: &str,
        command: &str,
        working_dir: Option<&str>,
        timeout_s: u64,
    ) -> Result<futures::stream::BoxStream<'static, std::result::Result<String, String>>> {
        let client = self.pool.client(host_id).await?;

        let exec = client
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(vec!["bash".to_string(), "-c".to_string(), command.to_string()]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(working_dir.unwrap_or(DEFAULT_WORKDIR).to_string()),
                    user: Some(DEFAULT_EXEC_USER.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        let StartExecResults::Attached { output, .. } = client.start_exec(&exec.id, None).await?
        else {
            return Err(ComputeError::other("Exec did not attach"));
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_s);
        let stream = futures::stream::unfold(
            (output, String::new(), false),
            move |(mut output, mut pending, finished)| async move {
                if finished {
                    return None;
                }
                loop {
                    // Flush one buffered line per poll
                    if let Some(pos) = pending.find('\n') {
                        let line: String = pending.drain(..=pos).collect();
                        return Some((Ok(line), (output, pending, false)));
                    }

                    let next =
                        tokio::time::timeout_at(deadline, output.next()).await;
                    match next {
                        Ok(Some(Ok(LogOutput::StdOut { message })))
                        | Ok(Some(Ok(LogOutput::StdErr { message }))) => {
                            pending.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(Some(Ok(_))) => {}
                        Ok(Some(Err(e))) => {
                            return Some((Err(e.to_string()), (output, pending, true)));
                        }
                        Ok(None) => {
                            if pending.is_empty() {
                                return None;
                            }
                            let rest = std::mem::take(&mut pending);
                            return Some((Ok(rest), (output, pending, true)));
                        }
                        Err(_) => {
                            return Some((
                                Err(format!("Command timed out after {} seconds", timeout_s)),
                                (output, pending, true),
                            ));
                        }
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }

    /// Inspect a container. A 404 maps to WorkspaceNotFound so the caller
    /// can treat it as host amnesia.
    pub async fn container_status(
        &self,
        host_id: &str,
        container_id: &str,
    ) -> Result<ContainerStatus> {
        let client = self.pool.client(host_id).await?;
        let inspect = client
            .inspect_container(container_id, None)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => ComputeError::WorkspaceNotFound(container_id.to_string()),
                other => ComputeError::Docker(other),
            })?;

        let state = inspect.state.as_ref();
        Ok(ContainerStatus {
            id: inspect.id.clone().unwrap_or_default(),
            status: state
                .and_then(|s| s.status.as_ref())
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            started_at: state
                .and_then(|s| s.started_at.as_deref())
                .and_then(|t| t.parse::<DateTime<Utc>>().ok()),
            exit_code: state.and_then(|s| s.exit_code),
            pid: state.and_then(|s| s.pid),
        })
    }

    /// One stats sample, parsed. Docker embeds the previous sample, so a
    /// single read is enough for the delta CPU calculation.
    pub async fn container_stats(
        &self,
        host_id: &str,
        container_id: &str,
    ) -> Result<ContainerMetrics> {
        let client = self.pool.client(host_id).await?;

        let started_at = self
            .container_status(host_id, container_id)
            .await
            .ok()
            .and_then(|s| s.started_at);

        let mut stream = client.stats(
            container_id,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );
        match stream.next().await {
            Some(Ok(stats)) => Ok(parse_container_stats(&stats, started_at)),
            Some(Err(e)) => Err(ComputeError::Docker(e)),
            None => Err(ComputeError::other("Empty stats stream")),
        }
    }

    /// Host capacity summed from workspace-labeled container reservations
    pub async fn server_stats(&self, host_id: &str) -> Result<ServerStats> {
        let client = self.pool.client(host_id).await?;
        let conn = self
            .pool
            .connection(host_id)
            .await
            .ok_or_else(|| ComputeError::HostNotFound(host_id.to_string()))?;

        let info = client.info().await?;

        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}=true", WORKSPACE_LABEL)],
        );
        let containers = client
            .list_containers(Some(ListContainersOptions {
                all: false,
                filters,
                ..Default::default()
            }))
            .await?;

        let mut used_cpu = 0.0;
        let mut used_memory_mib = 0i64;
        let mut used_disk_gib = 0i64;
        for summary in &containers {
            if let Some(id) = &summary.id {
                if let Ok(inspect) = client.inspect_container(id, None).await {
                    if let Some(host_config) = inspect.host_config {
                        if let Some(nano_cpus) = host_config.nano_cpus {
                            used_cpu += nano_cpus as f64 / 1e9;
                        }
                        if let Some(memory) = host_config.memory {
                            used_memory_mib += memory / (1024 * 1024);
                        }
                    }
                }
            }
            if let Some(labels) = &summary.labels {
                if let Some(disk) = labels.get("podex.disk_gib") {
                    used_disk_gib += disk.parse::<i64>().unwrap_or(0);
                }
            }
        }

        let (has_gpu, gpu_count, gpu_type) =
            discover_gpu(info.runtimes.as_ref(), info.labels.as_ref());

        Ok(ServerStats {
            hostname: conn.hostname.clone(),
            total_cpu: info.ncpu.unwrap_or(0),
            total_memory_mib: info.mem_total.unwrap_or(0) / (1024 * 1024),
            total_disk_gib: 100,
            used_cpu,
            used_memory_mib,
            used_disk_gib,
            active_workspaces: containers.len(),
            has_gpu,
            gpu_type,
            gpu_count,
            architecture: conn.architecture.clone(),
            status: if conn.is_healthy {
                "active".to_string()
            } else {
                "unhealthy".to_string()
            },
        })
    }

    /// List workspace containers on a host
    pub async fn list_containers(&self, host_id: &str, all: bool) -> Result<Vec<ContainerInfo>> {
        let client = self.pool.client(host_id).await?;
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}=true", WORKSPACE_LABEL)],
        );
        let containers = client
            .list_containers(Some(ListContainersOptions {
                all,
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerInfo {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                status: c.state.unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
            })
            .collect())
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}
