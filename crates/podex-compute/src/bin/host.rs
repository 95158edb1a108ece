// Compute host server binary
//
// Registers the Docker hosts listed in PODEX_WORKSPACE_HOSTS
// (id:address:port:arch[:tls[:cert_path]] entries, comma separated),
// runs the periodic host health check, and serves the workspace RPC
// surface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use podex_compute::pool::{HostPool, HostRegistration};
use podex_compute::server::{router, HostServerState};
use podex_compute::ComputeDriver;
use podex_core::Settings;

const HOST_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

fn parse_host_entry(entry: &str) -> Option<HostRegistration> {
    let parts: Vec<&str> = entry.split(':').collect();
    if parts.len() < 4 {
        return None;
    }
    Some(HostRegistration {
        host_id: parts[0].to_string(),
        hostname: parts[1].to_string(),
        address: parts[1].to_string(),
        docker_port: parts[2].parse().ok()?,
        architecture: parts[3].to_string(),
        tls_enabled: parts.get(4).map(|v| *v == "tls").unwrap_or(false),
        cert_path: parts.get(5).map(|v| v.to_string()),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "podex_compute=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("podex-compute-host starting...");

    let settings = Settings::from_env();
    let pool = Arc::new(HostPool::new());

    let host_entries = std::env::var("PODEX_WORKSPACE_HOSTS")
        .unwrap_or_else(|_| "local:localhost:2375:amd64".to_string());
    for entry in host_entries.split(',') {
        match parse_host_entry(entry.trim()) {
            Some(registration) => {
                let host_id = registration.host_id.clone();
                if !pool.add_host(registration).await {
                    warn!(host_id = %host_id, "Host registered unhealthy");
                }
            }
            None => warn!(entry = %entry, "Skipping malformed host entry"),
        }
    }

    let driver = Arc::new(ComputeDriver::new(pool.clone(), settings.clone()));
    let state = HostServerState {
        driver,
        registry: Arc::new(RwLock::new(HashMap::new())),
        settings,
    };

    // Periodic host health check toggles the healthy flag on each record
    {
        let pool = pool.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HOST_HEALTH_INTERVAL);
            loop {
                interval.tick().await;
                pool.check_all().await;
            }
        });
    }

    let app = router(state);
    let addr = std::env::var("PODEX_COMPUTE_BIND").unwrap_or_else(|_| "0.0.0.0:8001".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
