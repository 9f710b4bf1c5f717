use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use tmuxpilot_core::domain::{Project, Session, SessionKind, SessionStatus, Ticket};
use tmuxpilot_core::ring_buffer::RingBuffer;
use tmuxpilot_mux::{is_real_pane_id, TmuxAdapter};

use crate::error::SupervisorError;
use crate::event_bus::{Event, EventBus};
use crate::repository::Repository;

/// Literal instruction appended to every ticket-session command line, both
/// adhoc and regular, so the agent signals completion in a form the
/// Reviewer Orchestrator and Waiting Detector both recognize unambiguously.
const TASK_COMPLETE_INSTRUCTION: &str = "When all ticket requirements are met, output exactly ---TASK_COMPLETE--- on its own line followed by a brief summary.";

const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
const LISTED_SESSIONS_CAP: usize = 100;
const CAPTURE_TAIL_LINES: usize = 100;

/// In-memory bookkeeping for one live session, owned exclusively by the
/// supervisor. The persisted `Session` row is the read-only view everything
/// else in the daemon sees.
struct SessionHandle {
    session: Session,
    output: RingBuffer,
    /// Hash of the last captured pane text, so an unchanged pane never
    /// re-pushes identical lines or re-publishes `PaneOutput`.
    last_capture_hash: Option<u32>,
}

/// Owns the in-memory registry of active sessions. The sole mutator of
/// `Session.status` for live sessions; everything else treats the
/// persisted row as read-only.
pub struct Supervisor {
    mux: Arc<TmuxAdapter>,
    repo: Arc<Repository>,
    events: EventBus,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    capture_interval: Duration,
    liveness_interval: Duration,
    grace_period: Duration,
}

impl Supervisor {
    /// Construct with the default liveness interval (~2s) and grace period
    /// (5s); `capture_interval` is the only knob most callers need to vary.
    pub fn new(
        mux: Arc<TmuxAdapter>,
        repo: Arc<Repository>,
        events: EventBus,
        capture_interval: Duration,
    ) -> Self {
        Self::with_intervals(
            mux,
            repo,
            events,
            capture_interval,
            DEFAULT_LIVENESS_INTERVAL,
            DEFAULT_GRACE_PERIOD,
        )
    }

    pub fn with_intervals(
        mux: Arc<TmuxAdapter>,
        repo: Arc<Repository>,
        events: EventBus,
        capture_interval: Duration,
        liveness_interval: Duration,
        grace_period: Duration,
    ) -> Self {
        Self {
            mux,
            repo,
            events,
            sessions: RwLock::new(HashMap::new()),
            capture_interval,
            liveness_interval,
            grace_period,
        }
    }

    /// At startup, rehydrate every persisted `running`/`paused` session
    /// whose pane is still alive; mark the rest `completed`. Safe to call
    /// again later as `syncSessions` — the same reconciliation applies.
    pub async fn restore(&self) -> Result<(), SupervisorError> {
        self.reconcile().await
    }

    /// Ad hoc re-application of the boot-time recovery logic: rehydrates
    /// any DB-resident running session whose pane is alive but missing from
    /// the registry, and retires any registry entry whose pane has died.
    pub async fn sync_sessions(&self) -> Result<(), SupervisorError> {
        self.reconcile().await
    }

    async fn reconcile(&self) -> Result<(), SupervisorError> {
        let all = self.repo.load_all_sessions()?;
        let mut guard = self.sessions.write().await;
        for mut session in all {
            if !matches!(session.status, SessionStatus::Running | SessionStatus::Paused) {
                continue;
            }

            let alive = match &session.pane_id {
                Some(pane_id) if is_real_pane_id(pane_id) => {
                    self.mux.is_pane_alive(pane_id).await.unwrap_or(false)
                }
                _ => false,
            };

            if alive {
                guard.entry(session.id.clone()).or_insert_with(|| SessionHandle {
                    session: session.clone(),
                    output: RingBuffer::default(),
                    last_capture_hash: None,
                });
                continue;
            }

            tracing::info!(session_id = %session.id, "recovery: pane dead, marking session completed");
            session.status = SessionStatus::Completed;
            session.ended_at = Some(Utc::now());
            self.repo.save_session(&session)?;
            if let Some(handle) = guard.remove(&session.id) {
                self.events.publish(Event::SessionEnded {
                    session_id: handle.session.id,
                });
            }
        }
        Ok(())
    }

    async fn load_project(&self, project_id: &str) -> Result<Project, SupervisorError> {
        self.repo
            .load_project(project_id)?
            .ok_or_else(|| SupervisorError::ProjectNotFound(project_id.to_string()))
    }

    /// Start a generic, ticketless session.
    pub async fn start_session(
        &self,
        project_id: &str,
        cwd: Option<String>,
        initial_prompt: Option<String>,
        claude_cli_path: &str,
    ) -> Result<Session, SupervisorError> {
        let project = self.load_project(project_id).await?;
        let session_id = new_session_id();
        let command = build_adhoc_command(claude_cli_path, initial_prompt.as_deref());
        let title = format!("adhoc:{}", short_id(&session_id));
        self.create_and_register(
            project,
            session_id,
            None,
            None,
            SessionKind::Adhoc,
            cwd,
            &command,
            title,
        )
        .await
    }

    /// Start a session bound to a ticket; construction of the agent command
    /// line depends on whether the ticket itself is adhoc or regular.
    pub async fn start_ticket_session(
        &self,
        project_id: &str,
        ticket_id: &str,
        cwd: Option<String>,
        initial_prompt: Option<String>,
        claude_cli_path: &str,
    ) -> Result<Session, SupervisorError> {
        let project = self.load_project(project_id).await?;
        let ticket = self
            .repo
            .load_ticket(ticket_id)?
            .ok_or_else(|| SupervisorError::TicketNotFound(ticket_id.to_string()))?;

        {
            let guard = self.sessions.read().await;
            let already_running = guard.values().any(|h| {
                h.session.ticket_id.as_deref() == Some(ticket_id)
                    && h.session.status == SessionStatus::Running
            });
            if already_running {
                return Err(SupervisorError::AlreadyRunning(ticket_id.to_string()));
            }
        }

        let session_id = new_session_id();
        let command = build_ticket_command(claude_cli_path, &ticket, initial_prompt.as_deref());
        let title = pane_title_for(&ticket);
        self.create_and_register(
            project,
            session_id,
            Some(ticket_id.to_string()),
            None,
            SessionKind::Ticket,
            cwd,
            &command,
            title,
        )
        .await
    }

    /// Start the successor session of a handoff: same ticket, same project,
    /// a fresh pane, with `parent_session_id` recorded so the lineage is
    /// visible from the session row alone.
    #[allow(clippy::too_many_arguments)]
    pub async fn start_handoff_session(
        &self,
        project_id: &str,
        ticket_id: &str,
        parent_session_id: &str,
        cwd: Option<String>,
        initial_prompt: Option<String>,
        claude_cli_path: &str,
    ) -> Result<Session, SupervisorError> {
        let project = self.load_project(project_id).await?;
        let ticket = self
            .repo
            .load_ticket(ticket_id)?
            .ok_or_else(|| SupervisorError::TicketNotFound(ticket_id.to_string()))?;

        let session_id = new_session_id();
        let command = build_ticket_command(claude_cli_path, &ticket, initial_prompt.as_deref());
        let title = pane_title_for(&ticket);
        self.create_and_register(
            project,
            session_id,
            Some(ticket_id.to_string()),
            Some(parent_session_id.to_string()),
            SessionKind::Ticket,
            cwd,
            &command,
            title,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_and_register(
        &self,
        project: Project,
        session_id: String,
        ticket_id: Option<String>,
        parent_session_id: Option<String>,
        kind: SessionKind,
        cwd: Option<String>,
        command: &str,
        title: String,
    ) -> Result<Session, SupervisorError> {
        let session_exists = self
            .mux
            .session_exists(&project.tmux_session)
            .await
            .map_err(|e| SupervisorError::CreationFailed(e.to_string()))?;
        if !session_exists {
            return Err(SupervisorError::CreationFailed(format!(
                "multiplexer session not found: {}",
                project.tmux_session
            )));
        }

        let cwd = cwd.unwrap_or_else(|| project.repo_path.clone());
        let pane_id = self
            .mux
            .create_pane(&project.tmux_session, &cwd, command, project.tmux_window.as_deref())
            .await
            .map_err(|e| SupervisorError::CreationFailed(e.to_string()))?;

        if let Err(e) = self.mux.set_pane_title(&pane_id, &title).await {
            tracing::warn!(%e, pane_id, "failed to set pane title");
        }

        let session = Session {
            id: session_id,
            project_id: project.id,
            ticket_id,
            parent_session_id,
            kind,
            status: SessionStatus::Running,
            pane_id: Some(pane_id),
            context_percent: 0,
            started_at: Utc::now(),
            ended_at: None,
        };
        self.repo.save_session(&session)?;
        self.sessions.write().await.insert(
            session.id.clone(),
            SessionHandle {
                session: session.clone(),
                output: RingBuffer::default(),
                last_capture_hash: None,
            },
        );
        self.events.publish(Event::SessionStarted {
            session: session.clone(),
        });
        Ok(session)
    }

    /// Stop a session. Graceful (default): interrupt, wait out the grace
    /// period, force-kill if the pane is still alive. `force=true` skips
    /// straight to force-kill. Falls back to the DB row when the session is
    /// not in the registry so an external/orphaned pane can still be torn
    /// down.
    pub async fn stop_session(&self, session_id: &str, force: bool) -> Result<(), SupervisorError> {
        let in_memory = {
            let guard = self.sessions.read().await;
            guard.get(session_id).map(|h| h.session.clone())
        };

        let mut session = match in_memory {
            Some(s) => s,
            None => self
                .repo
                .load_session(session_id)?
                .ok_or_else(|| SupervisorError::SessionNotFound(session_id.to_string()))?,
        };

        if !matches!(session.status, SessionStatus::Running | SessionStatus::Paused) {
            return Err(SupervisorError::NotRunning(session_id.to_string()));
        }

        if let Some(pane_id) = session.pane_id.clone() {
            if is_real_pane_id(&pane_id) {
                if force {
                    let _ = self.mux.kill_pane(&pane_id).await;
                } else {
                    let _ = self.mux.send_interrupt(&pane_id).await;
                    tokio::time::sleep(self.grace_period).await;
                    if self.mux.is_pane_alive(&pane_id).await.unwrap_or(false) {
                        let _ = self.mux.kill_pane(&pane_id).await;
                    }
                }
            }
        }

        session.status = SessionStatus::Completed;
        session.ended_at = Some(Utc::now());
        self.repo.save_session(&session)?;
        self.sessions.write().await.remove(session_id);
        self.events.publish(Event::SessionEnded {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    /// Resolve a session id to its live pane id, enforcing that the session
    /// is currently running and its pane id is not an external placeholder.
    /// `pub(crate)` so the PTY manager can reuse the exact same precondition
    /// checks rather than re-deriving them.
    pub(crate) async fn resolve_running_pane(&self, session_id: &str) -> Result<String, SupervisorError> {
        let session = self
            .get_session(session_id)
            .await
            .ok_or_else(|| SupervisorError::SessionNotFound(session_id.to_string()))?;
        if session.status != SessionStatus::Running {
            return Err(SupervisorError::NotRunning(session_id.to_string()));
        }
        let pane_id = session
            .pane_id
            .ok_or_else(|| SupervisorError::InvalidPane(session_id.to_string()))?;
        if !is_real_pane_id(&pane_id) {
            return Err(SupervisorError::InvalidPane(pane_id));
        }
        Ok(pane_id)
    }

    /// Type `text` into a session's pane, followed by Enter.
    pub async fn send_input(&self, session_id: &str, text: &str) -> Result<(), SupervisorError> {
        let pane_id = self.resolve_running_pane(session_id).await?;
        self.mux
            .send_text(&pane_id, text)
            .await
            .map_err(|e| SupervisorError::InputFailed(e.to_string()))
    }

    /// Send raw, already hex-encoded keystrokes to a session's pane.
    pub async fn send_keys(&self, session_id: &str, hex_encoded_keys: &str) -> Result<(), SupervisorError> {
        let pane_id = self.resolve_running_pane(session_id).await?;
        self.mux
            .send_raw_keys(&pane_id, hex_encoded_keys)
            .await
            .map_err(|e| SupervisorError::InputFailed(e.to_string()))
    }

    /// Merge the DB row with in-memory status; in-memory wins when both
    /// exist since it reflects the most recent liveness/capture tick.
    pub async fn get_session(&self, session_id: &str) -> Option<Session> {
        if let Some(h) = self.sessions.read().await.get(session_id) {
            return Some(h.session.clone());
        }
        self.repo.load_session(session_id).ok().flatten()
    }

    /// Best-effort update of a session's `context_percent`, called by the
    /// context monitor on every change. Updates the in-memory handle first
    /// so `get_session` reflects it immediately for still-live sessions,
    /// then persists to the repository; either step failing silently to
    /// keep monitoring from ever interrupting the session it's watching.
    pub async fn update_context_percent(&self, session_id: &str, context_percent: u8) {
        let session = {
            let mut guard = self.sessions.write().await;
            match guard.get_mut(session_id) {
                Some(h) => {
                    h.session.context_percent = context_percent;
                    h.session.clone()
                }
                None => match self.repo.load_session(session_id) {
                    Ok(Some(mut s)) => {
                        s.context_percent = context_percent;
                        s
                    }
                    Ok(None) => return,
                    Err(e) => {
                        tracing::warn!(%e, session_id, "failed to load session for context_percent persistence");
                        return;
                    }
                },
            }
        };
        if let Err(e) = self.repo.save_session(&session) {
            tracing::warn!(%e, session_id, "failed to persist context_percent onto session row");
        }
    }

    /// The in-memory running session bound to `ticket_id`, if any. Used to
    /// deliver rejection feedback straight into a still-live agent pane
    /// instead of leaving it only on the ticket row.
    pub async fn running_session_for_ticket(&self, ticket_id: &str) -> Option<Session> {
        self.sessions
            .read()
            .await
            .values()
            .find(|h| h.session.ticket_id.as_deref() == Some(ticket_id) && h.session.status == SessionStatus::Running)
            .map(|h| h.session.clone())
    }

    /// Most-recent-first, optionally filtered by project, capped at 100.
    pub async fn list_sessions(&self, project_id: Option<&str>) -> Result<Vec<Session>, SupervisorError> {
        let mut sessions = self.repo.load_all_sessions()?;
        if let Some(project_id) = project_id {
            sessions.retain(|s| s.project_id == project_id);
        }
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        sessions.truncate(LISTED_SESSIONS_CAP);
        Ok(sessions)
    }

    /// Errors `SessionNotFound` if the session is not currently in memory —
    /// ring buffer history doesn't survive a restart.
    pub async fn get_session_output(&self, session_id: &str, lines: usize) -> Result<Vec<String>, SupervisorError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|h| h.output.last_n(lines))
            .ok_or_else(|| SupervisorError::SessionNotFound(session_id.to_string()))
    }

    /// Used by the Waiting Detector, which wants recent output even for a
    /// session it hasn't otherwise looked up; returns an empty vec instead
    /// of an error when the session is unknown.
    pub async fn recent_output(&self, session_id: &str, lines: usize) -> Vec<String> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|h| h.output.last_n(lines))
            .unwrap_or_default()
    }

    fn running_panes_snapshot(sessions: &HashMap<String, SessionHandle>) -> Vec<(String, String)> {
        sessions
            .values()
            .filter(|h| h.session.status == SessionStatus::Running)
            .filter_map(|h| h.session.pane_id.clone().map(|p| (h.session.id.clone(), p)))
            .collect()
    }

    /// ~2s tick: transition any session whose pane has vanished to
    /// `completed` and drop it from the registry.
    async fn liveness_tick(&self) {
        let running = {
            let guard = self.sessions.read().await;
            Self::running_panes_snapshot(&guard)
        };

        for (session_id, pane_id) in running {
            let alive = self.mux.is_pane_alive(&pane_id).await.unwrap_or(false);
            if alive {
                continue;
            }
            tracing::info!(session_id, pane_id, "pane no longer alive, marking session completed");
            let removed = self.sessions.write().await.remove(&session_id);
            let Some(mut handle) = removed else { continue };
            handle.session.status = SessionStatus::Completed;
            handle.session.ended_at = Some(Utc::now());
            if let Err(e) = self.repo.save_session(&handle.session) {
                tracing::warn!(%e, session_id, "failed to persist completed session");
            }
            self.events.publish(Event::SessionUpdated {
                session: handle.session.clone(),
            });
            self.events.publish(Event::SessionEnded { session_id });
        }
    }

    /// ~1s tick: capture each running session's pane tail, skip if its
    /// content hash is unchanged, otherwise push into the ring buffer and
    /// publish. Also promotes DB-resident running sessions with a valid
    /// pane id that aren't yet in the registry.
    async fn capture_tick(&self) {
        let running = {
            let guard = self.sessions.read().await;
            Self::running_panes_snapshot(&guard)
        };

        for (session_id, pane_id) in running {
            let text = match self.mux.capture_pane_tail(&pane_id, CAPTURE_TAIL_LINES).await {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(session_id, pane_id, %e, "capture-pane failed");
                    continue;
                }
            };
            let hash = hash32(&text);

            let changed_lines = {
                let mut guard = self.sessions.write().await;
                let Some(handle) = guard.get_mut(&session_id) else {
                    continue;
                };
                if handle.last_capture_hash == Some(hash) {
                    None
                } else {
                    handle.last_capture_hash = Some(hash);
                    let lines: Vec<String> = text.lines().map(str::to_string).collect();
                    handle.output.push_all(lines.clone());
                    Some(lines)
                }
            };

            if let Some(lines) = changed_lines {
                self.events.publish(Event::PaneOutput { session_id, lines });
            }
        }

        self.promote_orphans().await;
    }

    async fn promote_orphans(&self) {
        let all = match self.repo.load_all_sessions() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(%e, "failed to load sessions for orphan promotion");
                return;
            }
        };
        let mut guard = self.sessions.write().await;
        for session in all {
            let eligible = session.status == SessionStatus::Running
                && session.pane_id.as_deref().is_some_and(is_real_pane_id)
                && !guard.contains_key(&session.id);
            if eligible {
                tracing::info!(session_id = %session.id, "promoting externally-created session into registry");
                guard.insert(
                    session.id.clone(),
                    SessionHandle {
                        session,
                        output: RingBuffer::default(),
                        last_capture_hash: None,
                    },
                );
            }
        }
    }

    /// Run both periodic tasks until cancelled. Single-writer model: no
    /// per-session tasks, just these two ticks.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut liveness = tokio::time::interval(self.liveness_interval);
        let mut capture = tokio::time::interval(self.capture_interval);
        loop {
            tokio::select! {
                _ = liveness.tick() => {
                    self.liveness_tick().await;
                }
                _ = capture.tick() => {
                    self.capture_tick().await;
                }
                _ = cancel.cancelled() => {
                    tracing::info!("supervisor: shutting down");
                    break;
                }
            }
        }
    }
}

fn new_session_id() -> String {
    format!("sess-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
}

fn short_id(session_id: &str) -> &str {
    let tail = session_id.rsplit('-').next().unwrap_or(session_id);
    let start = tail.len().saturating_sub(8);
    &tail[start..]
}

fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_was_dash = false;
    for ch in text.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_was_dash = false;
        } else if !last_was_dash {
            slug.push('-');
            last_was_dash = true;
        }
    }
    slug.trim_matches('-').to_string()
}

fn pane_title_for(ticket: &Ticket) -> String {
    if ticket.is_adhoc {
        format!("adhoc:{}", slugify(&ticket.title))
    } else {
        ticket.external_id.clone()
    }
}

/// Escape a string for safe embedding inside a double-quoted shell word;
/// tmux hands the whole command line to the pane's shell unparsed.
fn shell_quote(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

fn build_adhoc_command(claude_cli_path: &str, initial_prompt: Option<&str>) -> String {
    let prompt = initial_prompt.unwrap_or("");
    format!("{claude_cli_path} \"{}\"", shell_quote(prompt))
}

fn build_ticket_command(claude_cli_path: &str, ticket: &Ticket, initial_prompt: Option<&str>) -> String {
    let instruction = if ticket.is_adhoc {
        format!(
            "Read {}, explore the codebase, summarize your understanding, and wait for confirmation before making any edits.",
            ticket.file_path
        )
    } else {
        format!("Read {} and implement the described changes.", ticket.file_path)
    };
    let mut prompt = instruction;
    if let Some(extra) = initial_prompt {
        prompt.push(' ');
        prompt.push_str(extra);
    }
    prompt.push(' ');
    prompt.push_str(TASK_COMPLETE_INSTRUCTION);
    format!("{claude_cli_path} \"{}\"", shell_quote(&prompt))
}

fn hash32(text: &str) -> u32 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish() as u32
}
