// Workspace auto-provision reconciler
//
// An active session whose workspace the compute host no longer knows
// (a 404 on lookup) gets its workspace re-created from the stored
// session config. Hosts that answer with other errors are assumed to
// still hold the workspace and are left alone.

use futures::future::join_all;
use serde_json::json;
use tracing::{info, warn};

use podex_storage::ProvisionCandidate;

use super::ReconcilerCtx;

enum Existence {
    Present,
    Missing,
    Unknown(String),
}

async fn check_exists(ctx: &ReconcilerCtx, candidate: &ProvisionCandidate) -> Existence {
    match ctx
        .compute
        .get_workspace(&candidate.workspace_id, &candidate.owner_id.to_string())
        .await
    {
        Ok(_) => Existence::Present,
        Err(e) if e.is_not_found() => Existence::Missing,
        Err(e) => Existence::Unknown(e.to_string()),
    }
}

pub async fn run_pass(ctx: &ReconcilerCtx) -> anyhow::Result<()> {
    let candidates = ctx.db.provision_candidates().await?;
    if candidates.is_empty() {
        return Ok(());
    }

    // Batch the existence checks instead of N sequential calls
    let checks = join_all(candidates.iter().map(|c| check_exists(ctx, c))).await;

    let mut provisioned = 0usize;
    for (candidate, existence) in candidates.iter().zip(checks) {
        match existence {
            Existence::Present => continue,
            Existence::Unknown(error) => {
                warn!(
                    workspace_id = %candidate.workspace_id,
                    error = %error,
                    "Error checking workspace existence"
                );
                continue;
            }
            Existence::Missing => {}
        }

        // Rebuild the container config from the stored workspace tier
        let Some(workspace) = ctx.db.get_workspace(&candidate.workspace_id).await? else {
            continue;
        };
        // The host substitutes its own architecture variant on create
        let image = &ctx.settings.workspace_image_amd64;
        let config = json!({
            "name": format!("workspace-{}", workspace.id),
            "image": image,
            "cpu_limit": workspace.cpu_limit,
            "memory_limit_mib": workspace.memory_limit_mib,
            "disk_limit_gib": workspace.disk_limit_gib,
            "bandwidth_limit_mbps": workspace.bandwidth_limit_mbps,
            "gpu": {"enabled": workspace.gpu_enabled, "count": 0},
            "labels": {
                "podex.session_id": candidate.session_id.to_string(),
                "podex.template": candidate.template_id.clone().unwrap_or_default(),
            },
        });

        info!(
            workspace_id = %candidate.workspace_id,
            session_id = %candidate.session_id,
            "Auto-provisioning workspace for active session"
        );

        match ctx
            .compute
            .create_workspace(
                &candidate.session_id.to_string(),
                &candidate.owner_id.to_string(),
                Some(&candidate.workspace_id),
                &config,
            )
            .await
        {
            Ok(_) => {
                ctx.db
                    .touch_workspace_activity(&candidate.workspace_id)
                    .await?;
                provisioned += 1;
                ctx.events.emit_to_session(
                    &candidate.session_id.to_string(),
                    "workspace_status",
                    json!({
                        "workspace_id": candidate.workspace_id,
                        "status": "running",
                    }),
                );
            }
            Err(e) => {
                warn!(
                    workspace_id = %candidate.workspace_id,
                    session_id = %candidate.session_id,
                    error = %e,
                    "Failed to auto-provision workspace"
                );
            }
        }
    }

    if provisioned > 0 {
        info!(count = provisioned, "Auto-provisioned workspaces for active sessions");
    }
    Ok(())
}
