// Background reconcilers
//
// Six periodic control loops, all built on the same monitored-job
// primitive: sleep, run one pass, log, repeat. A pass that fails is
// logged and retried on the next tick; it never kills the loop.
// Shutdown interrupts the sleep, lets in-flight work finish, and the
// task returns.

pub mod cleanup;
pub mod health;
pub mod provision;
pub mod quota;
pub mod standby;
pub mod watchdog;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use podex_agent::Orchestrator;
use podex_compute::ComputeClient;
use podex_core::Settings;
use podex_storage::Database;

use crate::events::SessionEventHub;

/// Shared dependencies for every reconciler pass
pub struct ReconcilerCtx {
    pub db: Database,
    pub compute: ComputeClient,
    pub events: Arc<SessionEventHub>,
    pub orchestrator: Arc<Orchestrator>,
    pub settings: Settings,
}

/// Spawn a cancellable periodic job.
///
/// Each tick sleeps first, then runs one pass with every error logged.
/// A shutdown signal interrupts the sleep; a pass already running
/// finishes before the task returns.
pub fn spawn_monitored<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut pass: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!(job = name, "Reconciler shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = pass().await {
                        error!(job = name, error = %e, "Reconciler pass failed");
                    }
                }
            }
        }
    })
}

/// Spawn every reconciler. The returned handles are awaited on shutdown.
pub fn spawn_all(ctx: Arc<ReconcilerCtx>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    {
        let ctx = ctx.clone();
        handles.push(spawn_monitored(
            "quota_reset",
            Duration::from_secs(300),
            shutdown.clone(),
            move || {
                let ctx = ctx.clone();
                async move { quota::run_pass(&ctx).await }
            },
        ));
    }

    {
        let ctx = ctx.clone();
        handles.push(spawn_monitored(
            "standby",
            Duration::from_secs(60),
            shutdown.clone(),
            move || {
                let ctx = ctx.clone();
                async move { standby::run_pass(&ctx).await }
            },
        ));
    }

    {
        let ctx = ctx.clone();
        handles.push(spawn_monitored(
            "workspace_provision",
            Duration::from_secs(60),
            shutdown.clone(),
            move || {
                let ctx = ctx.clone();
                async move { provision::run_pass(&ctx).await }
            },
        ));
    }

    {
        let ctx = ctx.clone();
        let interval = ctx.settings.agent_watchdog_interval;
        handles.push(spawn_monitored(
            "agent_watchdog",
            interval,
            shutdown.clone(),
            move || {
                let ctx = ctx.clone();
                async move { watchdog::run_pass(&ctx).await }
            },
        ));
    }

    {
        let ctx = ctx.clone();
        let checker = Arc::new(health::HealthChecker::new());
        let interval = ctx.settings.container_health_check_interval;
        handles.push(spawn_monitored(
            "container_health",
            interval,
            shutdown.clone(),
            move || {
                let ctx = ctx.clone();
                let checker = checker.clone();
                async move { checker.run_pass(&ctx).await }
            },
        ));
    }

    {
        let interval = ctx.settings.standby_cleanup_interval;
        handles.push(spawn_monitored(
            "standby_cleanup",
            interval,
            shutdown,
            move || {
                let ctx = ctx.clone();
                async move { cleanup::run_pass(&ctx).await }
            },
        ));
    }

    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_monitored_job_survives_failing_passes() {
        let (tx, rx) = watch::channel(false);
        let runs = Arc::new(AtomicUsize::new(0));

        let runs_in_job = runs.clone();
        let handle = spawn_monitored(
            "test_job",
            Duration::from_secs(10),
            rx,
            move || {
                let runs = runs_in_job.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("pass blew up")
                }
            },
        );

        // Three intervals pass; the job keeps running despite errors
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_sleep() {
        let (tx, rx) = watch::channel(false);
        let handle = spawn_monitored(
            "sleepy_job",
            Duration::from_secs(3600),
            rx,
            || async { Ok(()) },
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        // Returns long before the hour-long sleep elapses
        handle.await.unwrap();
    }
}
