use std::net::TcpListener as StdTcpListener;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};

use crate::error::TtydError;

const DEFAULT_BASE_PORT: u16 = 7681;
const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(5);
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_PORT_SCAN: u16 = 200;

/// A running ttyd subprocess exposing one tmux pane over HTTP. Dropping this
/// does not kill the child; callers hold it alongside the session and call
/// `shutdown` explicitly so the supervisor controls the termination order.
pub struct TtydHandle {
    pub port: u16,
    child: Child,
}

impl TtydHandle {
    /// Send SIGTERM equivalent by closing the process; ttyd has no graceful
    /// shutdown hook of its own, so killing it is the documented teardown.
    pub async fn shutdown(mut self) {
        let _ = self.child.kill().await;
    }
}

/// Spawns `ttyd` bound to a free port, wrapping a tmux pane attach so a
/// browser can reach it directly. `tmux_bin`, `session_name`, and `pane_id`
/// are composed into the inner `select-pane ; attach-session` shell command
/// exactly as the live CLI would run it.
pub struct TtydLauncher {
    ttyd_path: String,
    base_port: u16,
}

impl TtydLauncher {
    pub fn new(ttyd_path: impl Into<String>) -> Self {
        Self { ttyd_path: ttyd_path.into(), base_port: DEFAULT_BASE_PORT }
    }

    pub fn with_base_port(mut self, base_port: u16) -> Self {
        self.base_port = base_port;
        self
    }

    /// Find the first port at or after `base_port` with nothing listening
    /// on it, by attempting a local bind-and-release.
    fn find_free_port(&self) -> Result<u16, TtydError> {
        for offset in 0..MAX_PORT_SCAN {
            let candidate = self.base_port.saturating_add(offset);
            if StdTcpListener::bind(("127.0.0.1", candidate)).is_ok() {
                return Ok(candidate);
            }
        }
        Err(TtydError::NoFreePort(self.base_port))
    }

    pub async fn launch(&self, tmux_bin: &str, session_name: &str, pane_id: &str) -> Result<TtydHandle, TtydError> {
        let port = self.find_free_port()?;
        let attach_cmd = format!(
            "{tmux_bin} select-pane -t {pane_id} \\; attach-session -t {session_name}",
        );

        let child = Command::new(&self.ttyd_path)
            .arg("-W")
            .arg("-p")
            .arg(port.to_string())
            .arg("-t")
            .arg("disableLeaveAlert=true")
            .arg("-t")
            .arg("enableSixel=false")
            .arg("/bin/bash")
            .arg("-c")
            .arg(&attach_cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    TtydError::SpawnFailed(format!("{} not found on PATH", self.ttyd_path))
                } else {
                    TtydError::Io(e)
                }
            })?;

        wait_for_ready(port, DEFAULT_READINESS_TIMEOUT).await?;
        Ok(TtydHandle { port, child })
    }
}

async fn wait_for_ready(port: u16, deadline: Duration) -> Result<(), TtydError> {
    let url = format!("http://127.0.0.1:{port}/");
    let probe = async {
        loop {
            match reqwest::get(&url).await {
                Ok(resp) if resp.status().is_success() => return,
                _ => sleep(READINESS_POLL_INTERVAL).await,
            }
        }
    };
    timeout(deadline, probe).await.map_err(|_| TtydError::ReadinessTimeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_port_scan_finds_base_port_when_available() {
        let launcher = TtydLauncher::new("ttyd").with_base_port(19681);
        let port = launcher.find_free_port().unwrap();
        assert!(port >= 19681);
    }

    #[test]
    fn free_port_scan_skips_an_occupied_port() {
        let occupied = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let base = occupied.local_addr().unwrap().port();
        let launcher = TtydLauncher::new("ttyd").with_base_port(base);
        let port = launcher.find_free_port().unwrap();
        assert_ne!(port, base);
        drop(occupied);
    }

    #[tokio::test]
    async fn launch_with_missing_binary_reports_spawn_failed() {
        let launcher = TtydLauncher::new("/nonexistent/ttyd-binary").with_base_port(19700);
        let err = launcher.launch("tmux", "proj:0", "%1").await.unwrap_err();
        assert!(matches!(err, TtydError::SpawnFailed(_)));
    }
}
