// Standby reconciler
//
// Moves idle running workspaces to standby. The effective timeout is the
// session override, then the user default, then 60 minutes; an explicit
// zero means never. Status updates are compare-and-set so a concurrent
// API-initiated change wins.

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use podex_storage::StandbyCandidate;

use super::ReconcilerCtx;

const DEFAULT_TIMEOUT_MINUTES: i64 = 60;

/// Effective idle timeout in minutes; None means the workspace never
/// goes to standby
pub fn effective_timeout_minutes(candidate: &StandbyCandidate) -> Option<i64> {
    let minutes = candidate
        .session_timeout_minutes
        .or(candidate.user_timeout_minutes)
        .map(i64::from)
        .unwrap_or(DEFAULT_TIMEOUT_MINUTES);
    if minutes == 0 {
        None
    } else {
        Some(minutes)
    }
}

pub async fn run_pass(ctx: &ReconcilerCtx) -> anyhow::Result<()> {
    let now = Utc::now();
    let mut standby_count = 0usize;

    for candidate in ctx.db.standby_candidates().await? {
        let Some(timeout_minutes) = effective_timeout_minutes(&candidate) else {
            continue;
        };

        let last_activity = candidate
            .last_activity
            .unwrap_or(candidate.workspace_created_at);
        let idle = now - last_activity;
        if idle.num_minutes() <= timeout_minutes {
            continue;
        }

        let owner = candidate.owner_id.to_string();
        if let Err(e) = ctx
            .compute
            .stop_workspace(&candidate.workspace_id, &owner)
            .await
        {
            warn!(
                workspace_id = %candidate.workspace_id,
                error = %e,
                "Failed to stop idle workspace"
            );
            continue;
        }

        // CAS: an API-side transition since the query wins
        if ctx
            .db
            .cas_workspace_status(&candidate.workspace_id, "running", "standby")
            .await?
        {
            standby_count += 1;
            info!(
                workspace_id = %candidate.workspace_id,
                session_id = %candidate.session_id,
                idle_minutes = idle.num_minutes(),
                "Workspace moved to standby due to inactivity"
            );
            ctx.events.emit_to_session(
                &candidate.session_id.to_string(),
                "workspace_status",
                json!({
                    "workspace_id": candidate.workspace_id,
                    "status": "standby",
                    "standby_at": now.to_rfc3339(),
                }),
            );
        }
    }

    if standby_count > 0 {
        info!(count = standby_count, "Moved idle workspaces to standby");
    }
    Ok(())
}
