// Docker host connection pool
//
// One connection record per workspace host. Add/remove mutate the pool
// under the pool lock; per-host Docker operations run on a cloned client
// without holding it. A failed connect keeps the record with
// is_healthy=false so the host stays visible to operators.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use bollard::{Docker, API_DEFAULT_VERSION};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::error::{ComputeError, Result};

const DOCKER_CONNECT_TIMEOUT_SECS: u64 = 120;

/// Connection to one Docker host
#[derive(Clone)]
pub struct HostConnection {
    pub host_id: String,
    pub hostname: String,
    pub address: String,
    pub docker_port: u16,
    pub architecture: String,
    pub tls_enabled: bool,
    pub cert_path: Option<String>,
    pub client: Option<Docker>,
    pub is_healthy: bool,
    pub last_error: Option<String>,
}

impl std::fmt::Debug for HostConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConnection")
            .field("host_id", &self.host_id)
            .field("hostname", &self.hostname)
            .field("address", &self.address)
            .field("architecture", &self.architecture)
            .field("is_healthy", &self.is_healthy)
            .field("last_error", &self.last_error)
            .finish()
    }
}

/// Parameters for registering a host
#[derive(Debug, Clone)]
pub struct HostRegistration {
    pub host_id: String,
    pub hostname: String,
    pub address: String,
    pub docker_port: u16,
    pub architecture: String,
    pub tls_enabled: bool,
    pub cert_path: Option<String>,
}

/// Pool of Docker host connections
#[derive(Default)]
pub struct HostPool {
    connections: Mutex<HashMap<String, HostConnection>>,
}

impl HostPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host and establish its Docker connection. A connect failure
    /// records the host as unhealthy and returns false.
    pub async fn add_host(&self, registration: HostRegistration) -> bool {
        let mut conn = HostConnection {
            host_id: registration.host_id.clone(),
            hostname: registration.hostname,
            address: registration.address.clone(),
            docker_port: registration.docker_port,
            architecture: registration.architecture,
            tls_enabled: registration.tls_enabled,
            cert_path: registration.cert_path.clone(),
            client: None,
            is_healthy: false,
            last_error: None,
        };

        match connect_docker(
            &registration.address,
            registration.docker_port,
            registration.tls_enabled,
            registration.cert_path.as_deref(),
        )
        .await
        {
            Ok(client) => {
                conn.client = Some(client);
                conn.is_healthy = true;
                info!(
                    host_id = %conn.host_id,
                    address = %conn.address,
                    tls = conn.tls_enabled,
                    "Added host to pool"
                );
                let mut connections = self.connections.lock().await;
                connections.insert(conn.host_id.clone(), conn);
                true
            }
            Err(e) => {
                error!(
                    host_id = %conn.host_id,
                    address = %conn.address,
                    error = %e,
                    "Failed to connect to host"
                );
                conn.last_error = Some(e.to_string());
                let mut connections = self.connections.lock().await;
                connections.insert(conn.host_id.clone(), conn);
                false
            }
        }
    }

    /// Remove a host and drop its client
    pub async fn remove_host(&self, host_id: &str) {
        let mut connections = self.connections.lock().await;
        if connections.remove(host_id).is_some() {
            info!(host_id = %host_id, "Removed host from pool");
        }
    }

    /// Get the Docker client for a healthy host
    pub async fn client(&self, host_id: &str) -> Result<Docker> {
        let connections = self.connections.lock().await;
        let conn = connections
            .get(host_id)
            .ok_or_else(|| ComputeError::HostNotFound(host_id.to_string()))?;
        match (&conn.client, conn.is_healthy) {
            (Some(client), true) => Ok(client.clone()),
            _ => Err(ComputeError::HostUnavailable(host_id.to_string())),
        }
    }

    /// Connection record snapshot for a host
    pub async fn connection(&self, host_id: &str) -> Option<HostConnection> {
        self.connections.lock().await.get(host_id).cloned()
    }

    /// Snapshot of all healthy hosts
    pub async fn healthy_hosts(&self) -> Vec<HostConnection> {
        self.connections
            .lock()
            .await
            .values()
            .filter(|c| c.is_healthy)
            .cloned()
            .collect()
    }

    pub async fn host_ids(&self) -> Vec<String> {
        self.connections.lock().await.keys().cloned().collect()
    }

    /// Ping one host and record the outcome
    pub async fn check_host_health(&self, host_id: &str) -> bool {
        let client = {
            let connections = self.connections.lock().await;
            connections.get(host_id).and_then(|c| c.client.clone())
        };

        let healthy = match client {
            Some(client) => client.ping().await.is_ok(),
            None => false,
        };

        let mut connections = self.connections.lock().await;
        if let Some(conn) = connections.get_mut(host_id) {
            conn.is_healthy = healthy;
            if !healthy {
                conn.last_error = Some("Ping failed".to_string());
            } else {
                conn.last_error = None;
            }
        }
        healthy
    }

    /// Ping every host, toggling healthy flags
    pub async fn check_all(&self) {
        let ids = self.host_ids().await;
        for host_id in ids {
            self.check_host_health(&host_id).await;
        }
    }

    /// Drop every connection
    pub async fn close_all(&self) {
        let mut connections = self.connections.lock().await;
        connections.clear();
        info!("Closed all host connections");
    }
}

/// Shared pool handle
pub type SharedHostPool = Arc<HostPool>;

async fn connect_docker(
    address: &str,
    port: u16,
    tls_enabled: bool,
    cert_path: Option<&str>,
) -> Result<Docker> {
    let client = if tls_enabled {
        let certs = cert_path.ok_or_else(|| {
            ComputeError::other(format!("cert_path required for TLS connection to {}", address))
        })?;
        let certs = Path::new(certs);
        Docker::connect_with_ssl(
            &format!("https://{}:{}", address, port),
            &certs.join("key.pem"),
            &certs.join("cert.pem"),
            &certs.join("ca.pem"),
            DOCKER_CONNECT_TIMEOUT_SECS,
            API_DEFAULT_VERSION,
        )?
    } else {
        // Plain TCP for local development hosts
        Docker::connect_with_http(
            &format!("tcp://{}:{}", address, port),
            DOCKER_CONNECT_TIMEOUT_SECS,
            API_DEFAULT_VERSION,
        )?
    };

    // Verify the daemon answers before handing the client out
    client.ping().await?;
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(id: &str) -> HostRegistration {
        HostRegistration {
            host_id: id.to_string(),
            hostname: format!("{}.local", id),
            // Nothing listens on port 1: connection is refused immediately
            address: "127.0.0.1".to_string(),
            docker_port: 1,
            architecture: "amd64".to_string(),
            tls_enabled: false,
            cert_path: None,
        }
    }

    #[tokio::test]
    async fn test_failed_connect_keeps_unhealthy_record() {
        let pool = HostPool::new();
        let added = pool.add_host(registration("h1")).await;
        assert!(!added);

        let conn = pool.connection("h1").await.unwrap();
        assert!(!conn.is_healthy);
        assert!(conn.last_error.is_some());
        assert!(pool.healthy_hosts().await.is_empty());

        // The client lookup reports the host as unavailable, not unknown
        let err = pool.client("h1").await.unwrap_err();
        assert!(matches!(err, ComputeError::HostUnavailable(_)));
    }

    #[tokio::test]
    async fn test_unknown_host() {
        let pool = HostPool::new();
        let err = pool.client("nope").await.unwrap_err();
        assert!(matches!(err, ComputeError::HostNotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_host() {
        let pool = HostPool::new();
        pool.add_host(registration("h1")).await;
        pool.remove_host("h1").await;
        assert!(pool.connection("h1").await.is_none());
    }

    #[tokio::test]
    async fn test_tls_requires_cert_path() {
        let err = connect_docker("127.0.0.1", 1, true, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cert_path required"));
    }
}
