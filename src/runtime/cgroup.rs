//! Cgroup driver detection

use crate::ssh::RemoteExec;

pub const SYSTEMD: &str = "systemd";
pub const CGROUPFS: &str = "cgroupfs";

/// Probe the container runtime on a host for its cgroup driver
const PROBE: &str = "(docker info 2>/dev/null || crictl info 2>/dev/null) | grep -i cgroup";

/// Driver name from container runtime info output
pub fn parse_driver(output: &str) -> &'static str {
    let systemd = output
        .lines()
        .filter(|l| l.to_lowercase().contains("cgroup"))
        .any(|l| l.to_lowercase().contains(SYSTEMD));
    if systemd {
        SYSTEMD
    } else {
        CGROUPFS
    }
}

/// Cgroup driver of a host; an unreachable runtime means cgroupfs
pub async fn detect(remote: &dyn RemoteExec, host: &str) -> String {
    match remote.cmd(host, PROBE).await {
        Ok(out) => parse_driver(&out).to_string(),
        Err(e) => {
            tracing::warn!("Failed to detect cgroup driver on {}: {}", host, e);
            CGROUPFS.to_string()
        }
    }
}
