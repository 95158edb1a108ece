// Standby cleanup reconciler
//
// Workspaces parked in standby beyond the retention window lose their
// container; the session is archived (never deleted) and the workspace
// row removed. A per-user override adjusts the window and zero disables
// cleanup entirely.

use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{info, warn};

use podex_storage::CleanupCandidate;

use super::ReconcilerCtx;

/// Retention window in hours; None disables cleanup for this workspace
pub fn effective_max_hours(candidate: &CleanupCandidate, default_hours: u64) -> Option<i64> {
    match candidate.user_max_hours {
        Some(0) => None,
        Some(hours) => Some(i64::from(hours)),
        None if default_hours == 0 => None,
        None => Some(default_hours as i64),
    }
}

pub async fn run_pass(ctx: &ReconcilerCtx) -> anyhow::Result<()> {
    let now = Utc::now();
    let mut deleted = 0usize;

    for candidate in ctx.db.cleanup_candidates().await? {
        let Some(max_hours) =
            effective_max_hours(&candidate, ctx.settings.standby_max_hours_default)
        else {
            continue;
        };

        let standby_since = candidate
            .standby_at
            .unwrap_or(candidate.workspace_updated_at);
        let standby_duration = now - standby_since;
        if standby_duration <= Duration::hours(max_hours) {
            continue;
        }

        let owner = candidate.owner_id.to_string();
        if let Err(e) = ctx
            .compute
            .delete_workspace(&candidate.workspace_id, &owner)
            .await
        {
            // A host that already forgot the container is fine; anything
            // else retries next tick
            if !e.is_not_found() {
                warn!(
                    workspace_id = %candidate.workspace_id,
                    error = %e,
                    "Failed to cleanup standby workspace"
                );
                continue;
            }
        }

        ctx.db.archive_session(candidate.session_id).await?;
        ctx.db.delete_workspace(&candidate.workspace_id).await?;
        deleted += 1;

        info!(
            workspace_id = %candidate.workspace_id,
            session_id = %candidate.session_id,
            standby_hours = standby_duration.num_hours(),
            "Cleaned up long-standby workspace"
        );
        ctx.events.emit_to_session(
            &candidate.session_id.to_string(),
            "workspace_status",
            json!({
                "workspace_id": candidate.workspace_id,
                "status": "deleted",
            }),
        );
    }

    if deleted > 0 {
        info!(count = deleted, "Standby cleanup completed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn candidate(user_max: Option<i32>) -> CleanupCandidate {
        CleanupCandidate {
            workspace_id: "ws-1".to_string(),
            session_id: Uuid::now_v7(),
            owner_id: Uuid::now_v7(),
            standby_at: Some(Utc::now()),
            workspace_updated_at: Utc::now(),
            user_max_hours: user_max,
        }
    }

    #[test]
    fn test_user_override_wins() {
        assert_eq!(effective_max_hours(&candidate(Some(12)), 48), Some(12));
    }

    #[test]
    fn test_default_applies() {
        assert_eq!(effective_max_hours(&candidate(None), 48), Some(48));
    }

    #[test]
    fn test_zero_disables() {
        assert_eq!(effective_max_hours(&candidate(Some(0)), 48), None);
        assert_eq!(effective_max_hours(&candidate(None), 0), None);
    }
}
