// Workspace directory provisioning and XFS project quotas
//
// Before a container starts, its home directory is created under the data
// root, owned by uid 1000. In production an XFS project quota caps the
// directory at the workspace's disk tier; quota updates apply live and
// cleanup removes the project and projid entries.

use tokio::process::Command;
use tracing::{error, info, warn};

use podex_core::Settings;

use crate::pool::HostConnection;

/// Deterministic project id for a workspace (1..65535)
pub fn quota_project_id(workspace_id: &str) -> u32 {
    // FNV-1a fold: stable across processes, unlike a hasher seeded at random
    let mut hash: u32 = 0x811c_9dc5;
    for byte in workspace_id.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    (hash % 65535) + 1
}

async fn run_ssh(conn: &HostConnection, script: &str) -> Option<std::process::Output> {
    let result = Command::new("ssh")
        .arg("-o")
        .arg("StrictHostKeyChecking=no")
        .arg("-o")
        .arg("BatchMode=yes")
        .arg(format!("root@{}", conn.address))
        .arg(script)
        .output()
        .await;

    match result {
        Ok(output) => Some(output),
        Err(e) => {
            error!(host_id = %conn.host_id, error = %e, "Failed to run SSH command");
            None
        }
    }
}

/// Create `<data_root>/<workspace_id>/home` owned by uid 1000 and, in
/// production with quotas enabled, register the XFS project quota.
pub async fn setup_workspace_directory(
    settings: &Settings,
    conn: &HostConnection,
    workspace_id: &str,
    storage_gib: u64,
) -> bool {
    let data_path = &settings.workspace_data_path;
    let workspace_path = format!("{}/{}", data_path, workspace_id);

    if settings.is_development() {
        // Local DinD host: create the directory directly
        let status = Command::new("mkdir")
            .arg("-p")
            .arg(format!("{}/home", workspace_path))
            .status()
            .await;
        if let Err(e) = status {
            warn!(error = %e, "Failed to create workspace directory in dev");
        }
        return true;
    }

    let mkdir_script = format!(
        "mkdir -p {path}/home && chown -R 1000:1000 {path}",
        path = workspace_path
    );
    match run_ssh(conn, &mkdir_script).await {
        Some(output) if output.status.success() => {}
        Some(output) => {
            error!(
                stderr = %String::from_utf8_lossy(&output.stderr),
                "Failed to create workspace directory"
            );
            return false;
        }
        None => return false,
    }

    if settings.xfs_quotas_enabled {
        let project_id = quota_project_id(workspace_id);
        let quota_script = [
            format!("echo \"{}:{}\" >> /etc/projects", project_id, workspace_path),
            format!("echo \"ws_{}:{}\" >> /etc/projid", workspace_id, project_id),
            format!("xfs_quota -x -c \"project -s ws_{}\" {}", workspace_id, data_path),
            format!(
                "xfs_quota -x -c \"limit -p bhard={}g ws_{}\" {}",
                storage_gib, workspace_id, data_path
            ),
        ]
        .join(" && ");

        match run_ssh(conn, &quota_script).await {
            Some(output) if output.status.success() => {}
            Some(output) => {
                // Directory exists; quota failure is not fatal
                warn!(
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "Failed to set XFS quota"
                );
            }
            None => {}
        }
    }

    info!(
        host_id = %conn.host_id,
        workspace_id = %&workspace_id[..workspace_id.len().min(12)],
        storage_gib = storage_gib,
        "Created workspace directory"
    );
    true
}

/// Update the quota of a live workspace without restart
pub async fn update_xfs_quota(
    settings: &Settings,
    conn: &HostConnection,
    workspace_id: &str,
    storage_gib: u64,
) -> bool {
    if !settings.xfs_quotas_enabled || settings.is_development() {
        return true;
    }

    let script = format!(
        "xfs_quota -x -c \"limit -p bhard={}g ws_{}\" {}",
        storage_gib, workspace_id, settings.workspace_data_path
    );
    match run_ssh(conn, &script).await {
        Some(output) if output.status.success() => {
            info!(
                workspace_id = %&workspace_id[..workspace_id.len().min(12)],
                storage_gib = storage_gib,
                "Updated XFS quota"
            );
            true
        }
        _ => false,
    }
}

/// Remove the workspace directory and its quota bookkeeping entries
pub async fn remove_workspace_directory(
    settings: &Settings,
    conn: &HostConnection,
    workspace_id: &str,
) -> bool {
    let workspace_path = format!("{}/{}", settings.workspace_data_path, workspace_id);

    if settings.is_development() {
        let _ = Command::new("rm").arg("-rf").arg(&workspace_path).status().await;
        return true;
    }

    let _ = run_ssh(conn, &format!("rm -rf {}", workspace_path)).await;

    if settings.xfs_quotas_enabled {
        let cleanup = format!(
            "sed -i '/ws_{id}/d' /etc/projects; sed -i '/ws_{id}/d' /etc/projid",
            id = workspace_id
        );
        let _ = run_ssh(conn, &cleanup).await;
    }

    info!(
        host_id = %conn.host_id,
        workspace_id = %&workspace_id[..workspace_id.len().min(12)],
        "Removed workspace directory"
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_id_is_stable_and_in_range() {
        let a = quota_project_id("ws-0199c2");
        let b = quota_project_id("ws-0199c2");
        assert_eq!(a, b);
        assert!((1..=65535).contains(&a));
    }

    #[test]
    fn test_project_id_differs_per_workspace() {
        assert_ne!(quota_project_id("ws-a"), quota_project_id("ws-b"));
    }
}
