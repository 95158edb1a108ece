// Egress bandwidth shaping
//
// Applies a tbf qdisc on the host side of the container's veth pair, so
// the limit cannot be bypassed from inside the workspace. The veth is
// located by reading eth0's iflink from the container's network namespace
// and matching the interface index on the host. In development (DinD)
// this is a no-op; in production the script runs on the host over SSH.

use tokio::process::Command;
use tracing::{error, info, warn};

use podex_core::Settings;

use crate::pool::HostConnection;

const SSH_CONNECT_TIMEOUT_SECS: u32 = 10;

/// SSH parameters for reaching a workspace host
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub user: String,
    pub port: u16,
}

impl Default for SshTarget {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            port: 22,
        }
    }
}

/// Build the host-side script that finds the veth and applies the limit
fn tc_script(pid: i64, container_id: &str, bandwidth_mbps: u32) -> String {
    let short_id = &container_id[..container_id.len().min(12)];
    format!(
        r#"IFLINK=$(nsenter -t {pid} -n cat /sys/class/net/eth0/iflink 2>/dev/null)
if [ -z "$IFLINK" ]; then
    echo "Failed to get iflink"
    exit 1
fi
VETH=$(ip link | grep "^$IFLINK:" | cut -d':' -f2 | cut -d'@' -f1 | tr -d ' ')
if [ -z "$VETH" ]; then
    echo "Failed to find veth interface"
    exit 1
fi
tc qdisc replace dev $VETH root tbf rate {bandwidth_mbps}mbit burst 32kbit latency 400ms
echo "Applied limit to $VETH for container {short_id}"
"#
    )
}

/// Apply the egress limit for a running container.
///
/// `pid` is the container's init PID from inspect. Returns true when the
/// limit is in place (or skipped in development).
pub async fn apply_bandwidth_limit(
    settings: &Settings,
    conn: &HostConnection,
    pid: i64,
    container_id: &str,
    bandwidth_mbps: u32,
    ssh: &SshTarget,
) -> bool {
    if pid <= 0 {
        error!(container_id = %container_id, "Container PID not found");
        return false;
    }

    if settings.is_development() {
        // DinD hosts have no reachable network namespace from here
        warn!(
            container_id = %&container_id[..container_id.len().min(12)],
            bandwidth_mbps = bandwidth_mbps,
            "Bandwidth limiting skipped in development mode"
        );
        return true;
    }

    let script = tc_script(pid, container_id, bandwidth_mbps);
    let output = Command::new("ssh")
        .arg("-o")
        .arg("StrictHostKeyChecking=no")
        .arg("-o")
        .arg(format!("ConnectTimeout={}", SSH_CONNECT_TIMEOUT_SECS))
        .arg("-p")
        .arg(ssh.port.to_string())
        .arg(format!("{}@{}", ssh.user, conn.address))
        .arg(&script)
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => {
            info!(
                host_id = %conn.host_id,
                container_id = %&container_id[..container_id.len().min(12)],
                bandwidth_mbps = bandwidth_mbps,
                output = %String::from_utf8_lossy(&output.stdout).trim(),
                "Applied bandwidth limit"
            );
            true
        }
        Ok(output) => {
            error!(
                host_id = %conn.host_id,
                container_id = %&container_id[..container_id.len().min(12)],
                stderr = %String::from_utf8_lossy(&output.stderr),
                "Failed to apply bandwidth limit via SSH"
            );
            false
        }
        Err(e) => {
            error!(
                host_id = %conn.host_id,
                container_id = %container_id,
                error = %e,
                "Failed to run SSH for bandwidth limit"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tc_script_contents() {
        let script = tc_script(4242, "abcdef0123456789deadbeef", 50);
        assert!(script.contains("nsenter -t 4242 -n"));
        assert!(script.contains("tbf rate 50mbit"));
        assert!(script.contains("abcdef012345"));
        assert!(!script.contains("abcdef0123456789deadbeef"));
    }

    #[tokio::test]
    async fn test_development_mode_is_noop() {
        let settings = Settings {
            environment: "development".to_string(),
            ..Settings::from_env()
        };
        let conn = HostConnection {
            host_id: "h1".to_string(),
            hostname: "h1.local".to_string(),
            address: "127.0.0.1".to_string(),
            docker_port: 2375,
            architecture: "amd64".to_string(),
            tls_enabled: false,
            cert_path: None,
            client: None,
            is_healthy: true,
            last_error: None,
        };
        assert!(
            apply_bandwidth_limit(&settings, &conn, 1234, "container", 100, &SshTarget::default())
                .await
        );
    }

    #[tokio::test]
    async fn test_missing_pid_fails() {
        let settings = Settings::from_env();
        let conn = HostConnection {
            host_id: "h1".to_string(),
            hostname: "h1.local".to_string(),
            address: "127.0.0.1".to_string(),
            docker_port: 2375,
            architecture: "amd64".to_string(),
            tls_enabled: false,
            cert_path: None,
            client: None,
            is_healthy: true,
            last_error: None,
        };
        assert!(
            !apply_bandwidth_limit(&settings, &conn, 0, "container", 100, &SshTarget::default())
                .await
        );
    }
}
