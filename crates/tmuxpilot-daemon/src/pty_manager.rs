use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use tmuxpilot_mux::{native_pty_available, PtyBridge, TmuxAdapter};

use crate::error::{HubError, SupervisorError};
use crate::supervisor::Supervisor;

/// One connection's interactive attach: a real `tmux attach-session` client
/// running inside a pty, pinned to the pane at attach time. Distinct from
/// the supervisor's read-only capture tap — keystrokes and resizes here
/// reach the pane as if typed at a real terminal.
struct Attachment {
    bridge: PtyBridge,
    session_id: String,
    cols: u16,
    rows: u16,
    _reader_task: JoinHandle<()>,
}

/// Per-client PTY bridge. Maps `connectionId -> attached session`,
/// one native pty per attached connection.
pub struct PtyManager {
    supervisor: Arc<Supervisor>,
    mux: Arc<TmuxAdapter>,
    connections: RwLock<HashMap<String, Attachment>>,
}

impl PtyManager {
    pub fn new(supervisor: Arc<Supervisor>, mux: Arc<TmuxAdapter>) -> Self {
        Self {
            supervisor,
            mux,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Attach `connection_id` to `session_id`'s pane. Spawns `tmux
    /// select-pane \; attach-session` inside a pty so the pane is both
    /// selected and attached atomically, matching the ttyd external
    /// collaborator's own invocation shape. Returns the negotiated
    /// size plus the channel the caller reads raw output chunks from.
    pub async fn attach(
        &self,
        connection_id: &str,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(u16, u16, mpsc::Receiver<Vec<u8>>), HubError> {
        if self.connections.read().await.contains_key(connection_id) {
            return Err(HubError::PtyAlreadyAttached);
        }

        if !native_pty_available() {
            return Err(HubError::PtyUnavailable("no native pty support on this host".into()));
        }

        let pane_id = self
            .supervisor
            .resolve_running_pane(session_id)
            .await
            .map_err(|e| match e {
                SupervisorError::SessionNotFound(id) => HubError::SessionNotFound(id),
                SupervisorError::InvalidPane(_) | SupervisorError::NotRunning(_) => HubError::PtyInvalidPane,
                other => HubError::PtyAttachFailed(other.to_string()),
            })?;

        match self.mux.is_pane_alive(&pane_id).await {
            Ok(true) => {}
            Ok(false) => return Err(HubError::PtyInvalidPane),
            Err(e) => return Err(HubError::PtyAttachFailed(e.to_string())),
        }

        let tmux_bin = self.mux.tmux_bin().to_string();
        let shell_cmd = format!("{tmux_bin} select-pane -t {pane_id} \\; attach-session -t {pane_id}");
        let (bridge, rx, reader_task) = PtyBridge::spawn("/bin/sh", &["-c", &shell_cmd], rows, cols)
            .map_err(|e| HubError::PtyAttachFailed(e.to_string()))?;

        self.connections.write().await.insert(
            connection_id.to_string(),
            Attachment {
                bridge,
                session_id: session_id.to_string(),
                cols,
                rows,
                _reader_task: reader_task,
            },
        );

        Ok((cols, rows, rx))
    }

    /// Write bytes to the connection's pty as if typed at the terminal.
    pub async fn write(&self, connection_id: &str, data: &[u8]) -> Result<(), HubError> {
        let mut conns = self.connections.write().await;
        let attachment = conns.get_mut(connection_id).ok_or(HubError::PtyNotAttached)?;
        attachment
            .bridge
            .write(data)
            .map_err(|e| HubError::PtyAttachFailed(e.to_string()))
    }

    /// Reflow the connection's pty to a new terminal size.
    pub async fn resize(&self, connection_id: &str, cols: u16, rows: u16) -> Result<(), HubError> {
        let mut conns = self.connections.write().await;
        let attachment = conns.get_mut(connection_id).ok_or(HubError::PtyNotAttached)?;
        attachment
            .bridge
            .resize(rows, cols)
            .map_err(|e| HubError::PtyAttachFailed(e.to_string()))?;
        attachment.cols = cols;
        attachment.rows = rows;
        Ok(())
    }

    /// Detach and kill the connection's pty child, if any.
    pub async fn detach(&self, connection_id: &str) -> Result<(), HubError> {
        let mut conns = self.connections.write().await;
        let mut attachment = conns.remove(connection_id).ok_or(HubError::PtyNotAttached)?;
        let _ = attachment.bridge.kill();
        Ok(())
    }

    pub async fn is_attached(&self, connection_id: &str) -> bool {
        self.connections.read().await.contains_key(connection_id)
    }

    /// Whether the PTY bridge's underlying transport can even be used in
    /// this environment, independent of any particular connection.
    pub fn is_available(&self) -> bool {
        native_pty_available()
    }

    /// The session id a connection is attached to, if any. The hub uses
    /// this to exclude a PTY-attached client from ordinary
    /// `session:output` fan-out.
    pub async fn attached_session(&self, connection_id: &str) -> Option<String> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .map(|a| a.session_id.clone())
    }

    /// Tear down every connection currently attached to `session_id`, e.g.
    /// when that session is stopped out from under a live attach.
    pub async fn detach_session(&self, session_id: &str) {
        let mut conns = self.connections.write().await;
        let dead: Vec<String> = conns
            .iter()
            .filter(|(_, a)| a.session_id == session_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in dead {
            if let Some(mut attachment) = conns.remove(&id) {
                let _ = attachment.bridge.kill();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::Repository;
    use std::time::Duration;
    use tmuxpilot_core::domain::{Session, SessionKind, SessionStatus};

    async fn supervisor_with_session(status: SessionStatus, pane_id: Option<&str>) -> Arc<Supervisor> {
        let repo = Arc::new(Repository::open_in_memory().unwrap());
        let mux = Arc::new(TmuxAdapter::new());
        let events = crate::event_bus::EventBus::default();
        let supervisor = Arc::new(Supervisor::new(mux, repo.clone(), events, Duration::from_secs(1)));
        let session = Session {
            id: "s1".into(),
            project_id: "p1".into(),
            ticket_id: None,
            parent_session_id: None,
            kind: SessionKind::Adhoc,
            status,
            pane_id: pane_id.map(|s| s.to_string()),
            context_percent: 0,
            started_at: chrono::Utc::now(),
            ended_at: None,
        };
        repo.save_session(&session).unwrap();
        supervisor
    }

    #[tokio::test]
    async fn attach_to_unknown_session_is_session_not_found() {
        let repo = Arc::new(Repository::open_in_memory().unwrap());
        let mux = Arc::new(TmuxAdapter::new());
        let events = crate::event_bus::EventBus::default();
        let supervisor = Arc::new(Supervisor::new(mux.clone(), repo, events, Duration::from_secs(1)));
        let manager = PtyManager::new(supervisor, mux);

        let err = manager.attach("c1", "missing", 80, 24).await.unwrap_err();
        assert!(matches!(err, HubError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn attach_to_non_running_session_is_invalid_pane() {
        let supervisor = supervisor_with_session(SessionStatus::Completed, Some("%1")).await;
        let mux = Arc::new(TmuxAdapter::new());
        let manager = PtyManager::new(supervisor, mux);

        let err = manager.attach("c1", "s1", 80, 24).await.unwrap_err();
        assert!(matches!(err, HubError::PtyInvalidPane));
    }

    #[tokio::test]
    async fn detach_without_attach_is_not_attached() {
        let supervisor = supervisor_with_session(SessionStatus::Running, Some("%1")).await;
        let mux = Arc::new(TmuxAdapter::new());
        let manager = PtyManager::new(supervisor, mux);

        let err = manager.detach("c1").await.unwrap_err();
        assert!(matches!(err, HubError::PtyNotAttached));
        assert!(!manager.is_attached("c1").await);
    }
}
