// Container health reconciler
//
// Probes running workspaces with no recent activity using a lightweight
// remote echo. Consecutive failures are counted per workspace; reaching
// the threshold marks the workspace errored and emits an event. The
// counters are in-memory only: a process restart forgets failure streaks,
// so a chronic flapper escalates more slowly after a redeploy.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{info, warn};

use super::ReconcilerCtx;

const INACTIVE_MINUTES: i64 = 5;

#[derive(Default)]
pub struct HealthChecker {
    failure_counts: Mutex<HashMap<String, u32>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure; returns the new consecutive count
    fn record_failure(&self, workspace_id: &str) -> u32 {
        let mut counts = self.failure_counts.lock().unwrap();
        let count = counts.entry(workspace_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn clear(&self, workspace_id: &str) {
        self.failure_counts.lock().unwrap().remove(workspace_id);
    }

    pub async fn run_pass(&self, ctx: &ReconcilerCtx) -> anyhow::Result<()> {
        let inactive_since = Utc::now() - Duration::minutes(INACTIVE_MINUTES);
        let timeout_s = ctx.settings.container_health_check_timeout.as_secs();

        for candidate in ctx.db.health_candidates(inactive_since).await? {
            let healthy = ctx
                .compute
                .health_check_workspace(
                    &candidate.workspace_id,
                    &candidate.owner_id.to_string(),
                    timeout_s,
                )
                .await
                .unwrap_or(false);

            if healthy {
                self.clear(&candidate.workspace_id);
                continue;
            }

            let failures = self.record_failure(&candidate.workspace_id);
            warn!(
                workspace_id = %candidate.workspace_id,
                failures = failures,
                "Workspace health check failed"
            );

            if failures < ctx.settings.container_unresponsive_threshold {
                continue;
            }

            info!(
                workspace_id = %candidate.workspace_id,
                failures = failures,
                "Workspace container unresponsive"
            );
            if ctx
                .db
                .cas_workspace_status(&candidate.workspace_id, "running", "error")
                .await?
            {
                ctx.events.emit_to_session(
                    &candidate.session_id.to_string(),
                    "workspace_status",
                    json!({
                        "workspace_id": candidate.workspace_id,
                        "status": "error",
                        "error": "Container became unresponsive",
                    }),
                );
            }
            self.clear(&candidate.workspace_id);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_counting_and_reset() {
        let checker = HealthChecker::new();
        assert_eq!(checker.record_failure("ws-1"), 1);
        assert_eq!(checker.record_failure("ws-1"), 2);
        assert_eq!(checker.record_failure("ws-2"), 1);

        checker.clear("ws-1");
        assert_eq!(checker.record_failure("ws-1"), 1);
        assert_eq!(checker.record_failure("ws-2"), 2);
    }
}
