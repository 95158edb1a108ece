// Container and workspace specifications

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// GPU configuration for a container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GpuSpec {
    pub enabled: bool,
    /// 0 = all available GPUs when enabled, otherwise a specific count
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub gpu_type: Option<String>,
}

/// Specification for creating a workspace container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Number of CPUs, fractional allowed
    pub cpu_limit: f64,
    pub memory_limit_mib: u64,
    #[serde(default = "default_disk_gib")]
    pub disk_limit_gib: u64,
    #[serde(default = "default_bandwidth_mbps")]
    pub bandwidth_limit_mbps: u32,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// host path -> container path binds
    #[serde(default)]
    pub volumes: HashMap<String, String>,
    /// container port -> optional host port
    #[serde(default)]
    pub ports: HashMap<String, Option<u16>>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub network: Option<String>,
    /// Container runtime override, e.g. "runsc" for a sandboxed runtime
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub gpu: GpuSpec,
}

fn default_disk_gib() -> u64 {
    10
}

fn default_bandwidth_mbps() -> u32 {
    100
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            cpu_limit: 1.0,
            memory_limit_mib: 1024,
            disk_limit_gib: default_disk_gib(),
            bandwidth_limit_mbps: default_bandwidth_mbps(),
            environment: HashMap::new(),
            volumes: HashMap::new(),
            ports: HashMap::new(),
            labels: HashMap::new(),
            network: None,
            runtime: None,
            gpu: GpuSpec::default(),
        }
    }

    /// CPU limit in Docker nano-CPUs (1 CPU = 10^9)
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit * 1e9) as i64
    }

    /// Memory limit in bytes
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_limit_mib as i64) * 1024 * 1024
    }
}

/// Result of running a command in a workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Workspace status as tracked by the compute host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Creating,
    Running,
    Standby,
    Error,
    Deleted,
}

impl WorkspaceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkspaceStatus::Creating => "creating",
            WorkspaceStatus::Running => "running",
            WorkspaceStatus::Standby => "standby",
            WorkspaceStatus::Error => "error",
            WorkspaceStatus::Deleted => "deleted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nano_cpus_fractional() {
        let mut spec = ContainerSpec::new("ws", "img");
        spec.cpu_limit = 0.5;
        assert_eq!(spec.nano_cpus(), 500_000_000);
        spec.cpu_limit = 2.0;
        assert_eq!(spec.nano_cpus(), 2_000_000_000);
    }

    #[test]
    fn test_memory_bytes() {
        let mut spec = ContainerSpec::new("ws", "img");
        spec.memory_limit_mib = 2048;
        assert_eq!(spec.memory_bytes(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_spec_deserializes_with_defaults() {
        let spec: ContainerSpec = serde_json::from_value(serde_json::json!({
            "name": "ws-1",
            "image": "podex/workspace",
            "cpu_limit": 1.5,
            "memory_limit_mib": 1024
        }))
        .unwrap();
        assert_eq!(spec.disk_limit_gib, 10);
        assert_eq!(spec.bandwidth_limit_mbps, 100);
        assert!(!spec.gpu.enabled);
    }
}
