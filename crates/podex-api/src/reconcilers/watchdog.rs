// Agent watchdog reconciler
//
// An agent row stuck in 'running' past the timeout is asked to abort on
// its owning agent service (best effort), compare-and-set to 'error',
// and announced on the session channel with auto_recovered=true. A
// second pass over an already-recovered agent is a no-op because the CAS
// no longer matches.

use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{info, warn};

use super::ReconcilerCtx;

pub async fn run_pass(ctx: &ReconcilerCtx) -> anyhow::Result<()> {
    let now = Utc::now();
    let threshold = now - Duration::minutes(ctx.settings.agent_timeout_minutes as i64);
    let mut recovered = 0usize;

    for agent in ctx.db.running_agents().await? {
        let status_time = agent.status_changed_at.unwrap_or(agent.updated_at);
        if status_time > threshold {
            continue;
        }

        // Best effort: stop whatever the orchestrator still has in flight
        let cancelled = ctx.orchestrator.cancel_agent_tasks(&agent.agent_id).await;
        if cancelled > 0 {
            info!(
                agent_id = %agent.agent_id,
                cancelled = cancelled,
                "Cancelled in-flight tasks for stuck agent"
            );
        }

        // The DB transition proceeds whether or not the abort worked
        if !ctx
            .db
            .cas_agent_status(&agent.agent_id, "running", "error")
            .await?
        {
            continue;
        }

        recovered += 1;
        warn!(
            agent_id = %agent.agent_id,
            session_id = %agent.session_id,
            stuck_since = %status_time.to_rfc3339(),
            "Recovered stuck agent"
        );

        ctx.events.emit_to_session(
            &agent.session_id.to_string(),
            "agent_status",
            json!({
                "agent_id": agent.agent_id,
                "status": "error",
                "error": format!(
                    "Agent timed out after {} minutes in running state",
                    ctx.settings.agent_timeout_minutes
                ),
                "auto_recovered": true,
            }),
        );
    }

    if recovered > 0 {
        info!(count = recovered, "Agent watchdog recovered stuck agents");
    }
    Ok(())
}
