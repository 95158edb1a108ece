// Podex Compute - multi-host container control plane
//
// Host pool and Docker driver, bandwidth/quota provisioning, the git
// surface over workspace exec, the HTTP Compute Client used by the API
// and agent services, and the host-side RPC server.

pub mod bandwidth;
pub mod client;
pub mod driver;
pub mod error;
pub mod git;
pub mod pool;
pub mod quota;
pub mod remote;
pub mod server;
pub mod spec;
pub mod stats;

pub use client::{ComputeClient, WorkspaceHandle};
pub use driver::{ComputeDriver, ContainerInfo, ContainerStatus, WORKSPACE_LABEL};
pub use error::{ComputeError, Result};
pub use pool::{HostConnection, HostPool, HostRegistration, SharedHostPool};
pub use remote::ComputeToolBackend;
pub use server::{router, HostServerState, WorkspaceRecord};
pub use spec::{ContainerSpec, ExecResult, GpuSpec, WorkspaceStatus};
pub use stats::{ContainerMetrics, ServerStats};
