use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use tmuxpilot_core::domain::{HandoffEvent, NotificationKind, SessionKind, SessionStatus};

use crate::error::HandoffError;
use crate::event_bus::{Event, EventBus};
use crate::notifications::NotificationService;
use crate::repository::Repository;
use crate::supervisor::Supervisor;

const DEFAULT_POST_EXPORT_DELAY: Duration = Duration::from_secs(3);
const DEFAULT_IMPORT_DELAY: Duration = Duration::from_secs(3);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(60);

/// Unique id minted for each `HandoffEvent` row.
fn new_handoff_id() -> String {
    format!("handoff-{}", uuid_like())
}

fn uuid_like() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(0);
    format!("{}-{}", Utc::now().timestamp_millis(), NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Sequential state machine migrating a ticket session to a fresh one when
/// its context budget runs low. One handoff runs at a time per source
/// session (`HandoffInProgress` otherwise).
pub struct HandoffController {
    repo: Arc<Repository>,
    supervisor: Arc<Supervisor>,
    notifications: Arc<NotificationService>,
    events: EventBus,
    claude_cli_path: String,
    post_export_delay: Duration,
    import_delay: Duration,
    poll_interval: Duration,
    timeout: Duration,
    in_progress: RwLock<HashSet<String>>,
}

impl HandoffController {
    pub fn new(
        repo: Arc<Repository>,
        supervisor: Arc<Supervisor>,
        notifications: Arc<NotificationService>,
        events: EventBus,
        claude_cli_path: String,
    ) -> Self {
        Self {
            repo,
            supervisor,
            notifications,
            events,
            claude_cli_path,
            post_export_delay: DEFAULT_POST_EXPORT_DELAY,
            import_delay: DEFAULT_IMPORT_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_HANDOFF_TIMEOUT,
            in_progress: RwLock::new(HashSet::new()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_timings(
        repo: Arc<Repository>,
        supervisor: Arc<Supervisor>,
        notifications: Arc<NotificationService>,
        events: EventBus,
        claude_cli_path: String,
        post_export_delay: Duration,
        import_delay: Duration,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            repo,
            supervisor,
            notifications,
            events,
            claude_cli_path,
            post_export_delay,
            import_delay,
            poll_interval,
            timeout,
            in_progress: RwLock::new(HashSet::new()),
        }
    }

    pub async fn is_handing_off(&self, session_id: &str) -> bool {
        self.in_progress.read().await.contains(session_id)
    }

    /// Drive a full handoff for `session_id`. Returns the new session's id
    /// on success. `cancel` unwinds the migration from whichever state it is
    /// currently in.
    pub async fn trigger_handoff(
        &self,
        session_id: &str,
        cancel: CancellationToken,
    ) -> Result<String, HandoffError> {
        {
            let mut guard = self.in_progress.write().await;
            if !guard.insert(session_id.to_string()) {
                return Err(HandoffError::HandoffInProgress(session_id.to_string()));
            }
        }
        let result = self.run_handoff(session_id, cancel).await;
        self.in_progress.write().await.remove(session_id);
        result
    }

    async fn run_handoff(&self, session_id: &str, cancel: CancellationToken) -> Result<String, HandoffError> {
        let session = self
            .supervisor
            .get_session(session_id)
            .await
            .ok_or_else(|| HandoffError::Supervisor(crate::error::SupervisorError::SessionNotFound(session_id.to_string())))?;
        if session.kind != SessionKind::Ticket || session.status != SessionStatus::Running {
            return Err(HandoffError::NotEligible(session_id.to_string()));
        }
        let ticket_id = session
            .ticket_id
            .clone()
            .ok_or_else(|| HandoffError::NoActiveTicket(session_id.to_string()))?;
        let project = self
            .repo
            .load_project(&session.project_id)?
            .ok_or_else(|| HandoffError::Supervisor(crate::error::SupervisorError::ProjectNotFound(session.project_id.clone())))?;

        self.events.publish(Event::HandoffStarted {
            session_id: session_id.to_string(),
            ticket_id: ticket_id.clone(),
        });
        tracing::info!(session_id, ticket_id, "handoff: starting");

        match self
            .run_phases(session_id, &ticket_id, &project.handoff_path, &project.id, session.context_percent, cancel)
            .await
        {
            Ok(new_session_id) => Ok(new_session_id),
            Err((phase_after_terminate, e)) => {
                let session_preserved = !phase_after_terminate;
                self.events.publish(Event::HandoffFailed {
                    session_id: session_id.to_string(),
                    ticket_id: ticket_id.clone(),
                    reason: e.to_string(),
                    session_preserved,
                });
                if phase_after_terminate {
                    let _ = self.notifications.raise(
                        NotificationKind::HandoffFailed,
                        format!("handoff failed after terminating session: {e}"),
                        Some(session_id.to_string()),
                        Some(ticket_id),
                    );
                }
                Err(e)
            }
        }
    }

    /// Runs export -> wait-file -> terminate -> create -> import. The bool
    /// in the error tuple is true once the old session has been terminated,
    /// which flips the failure policy (`sessionPreserved:false` from then on).
    async fn run_phases(
        &self,
        session_id: &str,
        ticket_id: &str,
        handoff_path: &str,
        project_id: &str,
        context_at_handoff: u8,
        cancel: CancellationToken,
    ) -> Result<String, (bool, HandoffError)> {
        self.progress(session_id, ticket_id, "exporting", "sending export command");
        let pre_export_mtime = file_mtime(handoff_path);
        self.supervisor
            .send_input(session_id, "/export")
            .await
            .map_err(|e| (false, HandoffError::Supervisor(e)))?;
        tokio::time::sleep(self.post_export_delay).await;

        self.progress(session_id, ticket_id, "waiting_file", "waiting for handoff file");
        self.wait_for_handoff_file(handoff_path, pre_export_mtime, cancel.clone())
            .await
            .map_err(|e| (false, e))?;

        self.progress(session_id, ticket_id, "terminating", "stopping source session");
        self.supervisor
            .stop_session(session_id, false)
            .await
            .map_err(|e| (false, HandoffError::Supervisor(e)))?;

        self.progress(session_id, ticket_id, "creating_session", "creating successor session");
        let new_session = self
            .supervisor
            .start_handoff_session(project_id, ticket_id, session_id, None, None, &self.claude_cli_path)
            .await
            .map_err(|e| (true, HandoffError::Supervisor(e)))?;

        self.progress(session_id, ticket_id, "importing", "sending import command");
        tokio::time::sleep(self.import_delay).await;
        self.supervisor
            .send_input(&new_session.id, &format!("/import {handoff_path}"))
            .await
            .map_err(|e| (true, HandoffError::Supervisor(e)))?;
        self.supervisor
            .send_input(&new_session.id, continuation_prompt(ticket_id))
            .await
            .map_err(|e| (true, HandoffError::Supervisor(e)))?;

        let event = HandoffEvent {
            id: new_handoff_id(),
            from_session_id: session_id.to_string(),
            to_session_id: new_session.id.clone(),
            ticket_id: ticket_id.to_string(),
            context_at_handoff,
            created_at: Utc::now(),
        };
        self.repo.save_handoff_event(&event).map_err(|e| (true, HandoffError::Repository(e)))?;

        self.events.publish(Event::HandoffCompleted {
            session_id: session_id.to_string(),
            ticket_id: ticket_id.to_string(),
            child_session_id: new_session.id.clone(),
        });
        let _ = self.notifications.raise(
            NotificationKind::HandoffComplete,
            "handoff complete",
            Some(new_session.id.clone()),
            Some(ticket_id.to_string()),
        );
        tracing::info!(session_id, new_session_id = %new_session.id, "handoff: complete");
        Ok(new_session.id)
    }

    fn progress(&self, session_id: &str, ticket_id: &str, state: &str, message: &str) {
        self.events.publish(Event::HandoffProgress {
            session_id: session_id.to_string(),
            ticket_id: ticket_id.to_string(),
            state: state.to_string(),
            message: message.to_string(),
        });
    }

    /// Poll the handoff file's mtime until it is strictly newer than
    /// `pre_export_mtime` (or the file appears where it didn't exist before),
    /// bounded by `self.timeout`, honoring cancellation.
    async fn wait_for_handoff_file(
        &self,
        handoff_path: &str,
        pre_export_mtime: Option<SystemTime>,
        cancel: CancellationToken,
    ) -> Result<(), HandoffError> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Some(current) = file_mtime(handoff_path) {
                        let is_newer = match pre_export_mtime {
                            Some(pre) => current > pre,
                            None => true,
                        };
                        if is_newer {
                            return Ok(());
                        }
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(HandoffError::HandoffTimeout);
                    }
                }
                _ = cancel.cancelled() => {
                    return Err(HandoffError::HandoffCancelled);
                }
            }
        }
    }
}

fn file_mtime(path: &str) -> Option<SystemTime> {
    std::fs::metadata(Path::new(path)).ok()?.modified().ok()
}

fn continuation_prompt(ticket_id: &str) -> String {
    format!(
        "You are continuing ticket {ticket_id} from an imported handoff. Review the imported context, then resume work from where the previous session left off."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;
    use tmuxpilot_core::domain::{Project, Session};
    use tmuxpilot_mux::TmuxAdapter;

    fn controller() -> (HandoffController, Arc<Repository>, Arc<Supervisor>) {
        let repo = Arc::new(Repository::open_in_memory().unwrap());
        let mux = Arc::new(TmuxAdapter::new());
        let events = EventBus::default();
        let supervisor = Arc::new(Supervisor::new(mux, repo.clone(), events.clone(), StdDuration::from_secs(1)));
        let notifications = Arc::new(NotificationService::new(repo.clone(), events.clone()));
        let controller = HandoffController::new(
            repo.clone(),
            supervisor.clone(),
            notifications,
            events,
            "claude".into(),
        );
        (controller, repo, supervisor)
    }

    #[tokio::test]
    async fn handoff_on_unknown_session_is_not_eligible() {
        let (controller, _repo, _supervisor) = controller();
        let err = controller
            .trigger_handoff("ghost", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HandoffError::Supervisor(crate::error::SupervisorError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn handoff_on_adhoc_session_is_not_eligible() {
        let (controller, repo, _supervisor) = controller();
        repo.save_session(&Session {
            id: "s1".into(),
            project_id: "p1".into(),
            ticket_id: None,
            parent_session_id: None,
            kind: SessionKind::Adhoc,
            status: SessionStatus::Running,
            pane_id: Some("%1".into()),
            context_percent: 10,
            started_at: Utc::now(),
            ended_at: None,
        })
        .unwrap();

        let err = controller
            .trigger_handoff("s1", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HandoffError::NotEligible(_)));
    }

    #[tokio::test]
    async fn concurrent_handoff_for_same_session_is_rejected() {
        let (controller, repo, _supervisor) = controller();
        repo.save_project(&Project {
            id: "p1".into(),
            repo_path: "/tmp".into(),
            tmux_session: "main".into(),
            tmux_window: None,
            tickets_path: "/tmp/tickets".into(),
            handoff_path: "/tmp/handoff.md".into(),
        })
        .unwrap();
        repo.save_session(&Session {
            id: "s1".into(),
            project_id: "p1".into(),
            ticket_id: Some("t1".into()),
            parent_session_id: None,
            kind: SessionKind::Ticket,
            status: SessionStatus::Running,
            pane_id: Some("%1".into()),
            context_percent: 90,
            started_at: Utc::now(),
            ended_at: None,
        })
        .unwrap();

        controller.in_progress.write().await.insert("s1".to_string());
        let err = controller
            .trigger_handoff("s1", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HandoffError::HandoffInProgress(_)));
    }

    #[test]
    fn continuation_prompt_mentions_ticket_id() {
        let prompt = continuation_prompt("t42");
        assert!(prompt.contains("t42"));
    }
}
