use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;

use tmuxpilot_core::domain::{ClaudeState, MonitoredSession, NotificationKind};
use tmuxpilot_core::transcript::{self, DEFAULT_CONTEXT_WINDOW_TOKENS};

use crate::event_bus::{Event, EventBus};
use crate::notifications::NotificationService;
use crate::supervisor::Supervisor;

/// `HANDOFF_THRESHOLD_PERCENT` names the *remaining* context budget (e.g.
/// 20 means "fire with 20% of the window left"), but `MonitoredSession`
/// tracks *usage*. Converts one into the other so every comparison site
/// reasons about the same direction.
pub fn usage_threshold(remaining_threshold_percent: u8) -> u8 {
    100 - remaining_threshold_percent.min(100)
}

/// Find the newest `*.jsonl` transcript file directly under `project_dir`.
/// Returns `None` if the directory has no transcripts yet.
pub fn resolve_transcript_path(project_dir: &Path) -> Option<PathBuf> {
    let pattern = project_dir.join("*.jsonl");
    let pattern = pattern.to_string_lossy().into_owned();
    glob::glob(&pattern)
        .ok()?
        .filter_map(Result::ok)
        .filter_map(|p| {
            let modified = p.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, p))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, p)| p)
}

/// Tracks each session's agent transcript, folding new JSONL entries into a
/// running context-percent/state estimate and raising a `context_low`
/// notification the first time a session crosses the configured threshold.
///
/// Prefers being woken by a filesystem watcher the instant a transcript
/// grows; a fixed-interval poll is always also run as a resilient fallback
/// so a watcher that silently stops delivering events (happens on some
/// network filesystems) never stalls context tracking.
pub struct ContextMonitor {
    sessions: RwLock<HashMap<String, MonitoredSession>>,
    events: EventBus,
    notifications: Arc<NotificationService>,
    supervisor: Arc<Supervisor>,
    window_tokens: u64,
    /// Remaining-context percentage that triggers a threshold crossing
    /// (e.g. 20 = "fire once 20% of the context window is left"). Use
    /// [`usage_threshold`] to compare against `context_percent`, which
    /// tracks usage rather than remaining budget.
    threshold_percent: u8,
    poll_interval: Duration,
    wake: Arc<Notify>,
    _watcher: Option<RecommendedWatcher>,
}

impl ContextMonitor {
    pub fn new(
        events: EventBus,
        notifications: Arc<NotificationService>,
        supervisor: Arc<Supervisor>,
        threshold_percent: u8,
        poll_interval: Duration,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            events,
            notifications,
            supervisor,
            window_tokens: DEFAULT_CONTEXT_WINDOW_TOKENS,
            threshold_percent,
            poll_interval,
            wake: Arc::new(Notify::new()),
            _watcher: None,
        }
    }

    /// Best-effort: watch `project_dir` for changes so the poll loop wakes
    /// immediately instead of waiting out the interval. Failure to install
    /// a watcher (e.g. inotify limits hit) is logged and otherwise ignored;
    /// the interval-based poll still runs regardless.
    pub fn watch_directory(&mut self, project_dir: &Path) {
        let wake = self.wake.clone();
        let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                wake.notify_one();
            }
        }) {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(%e, "failed to install filesystem watcher, relying on polling");
                return;
            }
        };
        if let Err(e) = watcher.watch(project_dir, RecursiveMode::NonRecursive) {
            tracing::warn!(%e, path = %project_dir.display(), "failed to watch project directory");
            return;
        }
        self._watcher = Some(watcher);
    }

    pub async fn register(&self, session_id: String, transcript_path: PathBuf) {
        let monitored = MonitoredSession {
            session_id: session_id.clone(),
            transcript_path,
            file_position: 0,
            context_percent: 0,
            total_tokens: 0,
            claude_state: ClaudeState::Unknown,
            last_usage: None,
            threshold_notified: false,
        };
        self.sessions.write().await.insert(session_id, monitored);
    }

    pub async fn context_percent(&self, session_id: &str) -> Option<u8> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|m| m.context_percent)
    }

    pub async fn claude_state(&self, session_id: &str) -> Option<ClaudeState> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|m| m.claude_state)
    }

    /// Read whatever bytes were appended to a session's transcript since the
    /// last read, fold each JSONL line into the running estimate, and raise
    /// `context_low` the first time the threshold is crossed.
    async fn poll_session(&self, session_id: &str) -> std::io::Result<()> {
        let mut sessions = self.sessions.write().await;
        let Some(monitored) = sessions.get_mut(session_id) else {
            return Ok(());
        };

        let mut file = match std::fs::File::open(&monitored.transcript_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        file.seek(SeekFrom::Start(monitored.file_position))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        if buf.is_empty() {
            return Ok(());
        }
        monitored.file_position += buf.len() as u64;

        let previous_percent = monitored.context_percent;
        for line in buf.lines() {
            let Some(entry) = transcript::parse_entry(line) else {
                continue;
            };
            let next = transcript::apply_entry(monitored, &entry, self.window_tokens);
            *monitored = next;
        }

        let fire_at = usage_threshold(self.threshold_percent);
        let crossed = monitored.context_percent >= fire_at && !monitored.threshold_notified;
        if crossed {
            monitored.threshold_notified = true;
        }
        let reset = monitored.context_percent < fire_at && monitored.threshold_notified;
        if reset {
            monitored.threshold_notified = false;
        }
        let percent_changed = monitored.context_percent != previous_percent;
        let snapshot = monitored.clone();
        drop(sessions);

        if percent_changed {
            self.events.publish(Event::ContextPercentUpdated {
                session_id: session_id.to_string(),
                context_percent: snapshot.context_percent,
            });

            // Routed through the supervisor rather than the repository
            // directly so a still-running session's in-memory handle (what
            // `get_session` actually returns) picks up the fresh value too,
            // not just the persisted row.
            self.supervisor
                .update_context_percent(session_id, snapshot.context_percent)
                .await;
        }

        if crossed {
            if let Err(e) = self.notifications.raise(
                NotificationKind::ContextLow,
                format!("context at {}%", snapshot.context_percent),
                Some(session_id.to_string()),
                None,
            ) {
                tracing::warn!(%e, session_id, "failed to raise context_low notification");
            }
        }

        Ok(())
    }

    async fn poll_all(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.poll_session(&id).await {
                tracing::warn!(%e, session_id = %id, "failed reading transcript");
            }
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {
                    self.poll_all().await;
                }
                _ = self.wake.notified() => {
                    self.poll_all().await;
                }
                _ = cancel.cancelled() => {
                    tracing::info!("context monitor: shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    use tmuxpilot_mux::{TmuxAdapter, TmuxExecutor};

    use crate::repository::Repository;

    fn test_supervisor(repo: Arc<Repository>, events: EventBus) -> Arc<Supervisor> {
        let mux = Arc::new(TmuxAdapter::with_executor(TmuxExecutor::with_bin("/nonexistent/tmux-binary")));
        Arc::new(Supervisor::new(mux, repo, events, Duration::from_secs(1)))
    }

    fn monitor() -> ContextMonitor {
        let repo = Arc::new(Repository::open_in_memory().unwrap());
        let events = EventBus::default();
        let notifications = Arc::new(NotificationService::new(repo.clone(), events.clone()));
        let supervisor = test_supervisor(repo, events.clone());
        ContextMonitor::new(events, notifications, supervisor, 20, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn reading_new_entries_updates_context_percent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcript.jsonl");
        std::fs::write(
            &path,
            r#"{"usage":{"input_tokens":100000,"output_tokens":0,"cache_creation_input_tokens":0,"cache_read_input_tokens":0}}"#,
        )
        .unwrap();

        let monitor = monitor();
        monitor.register("s1".into(), path).await;
        monitor.poll_session("s1").await.unwrap();

        assert_eq!(monitor.context_percent("s1").await, Some(50));
    }

    #[tokio::test]
    async fn crossing_threshold_raises_notification_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcript.jsonl");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"{{"usage":{{"input_tokens":170000,"output_tokens":0,"cache_creation_input_tokens":0,"cache_read_input_tokens":0}}}}"#
        )
        .unwrap();
        drop(file);

        let repo = Arc::new(Repository::open_in_memory().unwrap());
        let events = EventBus::default();
        let notifications = Arc::new(NotificationService::new(repo.clone(), events.clone()));
        let supervisor = test_supervisor(repo, events.clone());
        let monitor = ContextMonitor::new(events, notifications.clone(), supervisor, 20, Duration::from_millis(50));
        monitor.register("s1".into(), path.clone()).await;

        monitor.poll_session("s1").await.unwrap();
        assert_eq!(notifications.unread().unwrap().len(), 1);

        // Polling again with no new bytes must not raise a second notification.
        monitor.poll_session("s1").await.unwrap();
        assert_eq!(notifications.unread().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_session_is_a_no_op() {
        let monitor = monitor();
        monitor.poll_session("ghost").await.unwrap();
    }

    #[test]
    fn usage_threshold_converts_remaining_budget_to_a_usage_floor() {
        assert_eq!(usage_threshold(20), 80);
        assert_eq!(usage_threshold(0), 100);
        assert_eq!(usage_threshold(100), 0);
    }

    #[tokio::test]
    async fn usage_below_the_remaining_threshold_does_not_cross() {
        // 120_000 / 200_000 = 60% usage; with a 20%-remaining threshold the
        // fire point is 80% usage, so this must not raise a notification.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcript.jsonl");
        std::fs::write(
            &path,
            r#"{"usage":{"input_tokens":120000,"output_tokens":0,"cache_creation_input_tokens":0,"cache_read_input_tokens":0}}"#,
        )
        .unwrap();

        let repo = Arc::new(Repository::open_in_memory().unwrap());
        let events = EventBus::default();
        let notifications = Arc::new(NotificationService::new(repo.clone(), events.clone()));
        let supervisor = test_supervisor(repo, events.clone());
        let monitor = ContextMonitor::new(events, notifications.clone(), supervisor, 20, Duration::from_millis(50));
        monitor.register("s1".into(), path).await;
        monitor.poll_session("s1").await.unwrap();

        assert_eq!(monitor.context_percent("s1").await, Some(60));
        assert_eq!(notifications.unread().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn context_percent_is_persisted_onto_the_session_row() {
        use tmuxpilot_core::domain::{Session, SessionKind, SessionStatus};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcript.jsonl");
        std::fs::write(
            &path,
            r#"{"usage":{"input_tokens":100000,"output_tokens":0,"cache_creation_input_tokens":0,"cache_read_input_tokens":0}}"#,
        )
        .unwrap();

        let repo = Arc::new(Repository::open_in_memory().unwrap());
        repo.save_session(&Session {
            id: "s1".into(),
            project_id: "p1".into(),
            ticket_id: None,
            parent_session_id: None,
            kind: SessionKind::Adhoc,
            status: SessionStatus::Running,
            pane_id: Some("%1".into()),
            context_percent: 0,
            started_at: chrono::Utc::now(),
            ended_at: None,
        })
        .unwrap();

        let events = EventBus::default();
        let notifications = Arc::new(NotificationService::new(repo.clone(), events.clone()));
        let supervisor = test_supervisor(repo.clone(), events.clone());
        let monitor = ContextMonitor::new(events, notifications, supervisor.clone(), 20, Duration::from_millis(50));
        monitor.register("s1".into(), path).await;
        monitor.poll_session("s1").await.unwrap();

        let stored = repo.load_session("s1").unwrap().unwrap();
        assert_eq!(stored.context_percent, 50);

        // The supervisor's own view (what `get_session` returns to callers
        // like the handoff controller) must agree with the persisted row.
        let via_supervisor = supervisor.get_session("s1").await.unwrap();
        assert_eq!(via_supervisor.context_percent, 50);
    }

    #[tokio::test]
    async fn context_update_is_not_republished_when_percent_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcript.jsonl");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"{{"usage":{{"input_tokens":100000,"output_tokens":0,"cache_creation_input_tokens":0,"cache_read_input_tokens":0}}}}"#
        )
        .unwrap();
        drop(file);

        let repo = Arc::new(Repository::open_in_memory().unwrap());
        let events = EventBus::default();
        let notifications = Arc::new(NotificationService::new(repo.clone(), events.clone()));
        let supervisor = test_supervisor(repo, events.clone());
        let monitor = ContextMonitor::new(events, notifications, supervisor, 20, Duration::from_millis(50));
        monitor.register("s1".into(), path.clone()).await;

        let mut rx = monitor.events.subscribe();
        monitor.poll_session("s1").await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            Event::ContextPercentUpdated { context_percent: 50, .. }
        ));

        // Append a line with no usage block — the percent doesn't move, so
        // no second `ContextPercentUpdated` should be published.
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, r#"{{"stop_reason":"end_turn"}}"#).unwrap();
        drop(file);
        monitor.poll_session("s1").await.unwrap();

        // A short timeout confirms nothing further arrived rather than
        // blocking forever if the regression reappears.
        let res = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(res.is_err(), "expected no further ContextPercentUpdated event");
    }
}
