use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use tmuxpilot_core::domain::{
    HandoffEvent, Notification, NotificationKind, Project, Session, StateHistoryEntry, Ticket,
    TicketState, TransitionReason, TransitionTrigger,
};

use crate::error::RepositoryError;

/// SQLite-backed persistence for every entity the daemon needs to survive a
/// restart: sessions, tickets, their state history, and notifications.
///
/// A single `Mutex<Connection>` is sufficient — sqlite itself serializes
/// writers, and the daemon's write volume (session/ticket transitions,
/// notifications) is low enough that lock contention is never the
/// bottleneck.
pub struct Repository {
    conn: Mutex<Connection>,
}

impl Repository {
    pub fn open(path: &std::path::Path) -> Result<Self, RepositoryError> {
        let conn = Connection::open(path)?;
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.migrate()?;
        Ok(repo)
    }

    pub fn open_in_memory() -> Result<Self, RepositoryError> {
        let conn = Connection::open_in_memory()?;
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.migrate()?;
        Ok(repo)
    }

    fn migrate(&self) -> Result<(), RepositoryError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tickets (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS state_history (
                ticket_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (ticket_id, seq)
            );
            CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                dedup_owner TEXT,
                dedup_kind TEXT,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS review_cache (
                ticket_id TEXT PRIMARY KEY,
                summary TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS handoff_events (
                id TEXT PRIMARY KEY,
                from_session_id TEXT NOT NULL,
                data TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Projects
    // ---------------------------------------------------------------

    pub fn save_project(&self, project: &Project) -> Result<(), RepositoryError> {
        let json = serde_json::to_string(project)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO projects (id, data) VALUES (?1, ?2)",
            params![project.id, json],
        )?;
        Ok(())
    }

    pub fn load_project(&self, project_id: &str) -> Result<Option<Project>, RepositoryError> {
        let conn = self.conn.lock().unwrap();
        let json: Option<String> = conn
            .query_row(
                "SELECT data FROM projects WHERE id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
    }

    pub fn load_all_projects(&self) -> Result<Vec<Project>, RepositoryError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT data FROM projects")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(serde_json::from_str(&row?)?);
        }
        Ok(projects)
    }

    // ---------------------------------------------------------------
    // Handoff events
    // ---------------------------------------------------------------

    /// Persist one handoff audit row. Invariant #6: exactly one row per
    /// `handoff:completed` event.
    pub fn save_handoff_event(&self, event: &HandoffEvent) -> Result<(), RepositoryError> {
        let json = serde_json::to_string(event)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO handoff_events (id, from_session_id, data) VALUES (?1, ?2, ?3)",
            params![event.id, event.from_session_id, json],
        )?;
        Ok(())
    }

    pub fn load_handoff_events_for_session(
        &self,
        from_session_id: &str,
    ) -> Result<Vec<HandoffEvent>, RepositoryError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT data FROM handoff_events WHERE from_session_id = ?1")?;
        let rows = stmt.query_map(params![from_session_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    // ---------------------------------------------------------------
    // Sessions
    // ---------------------------------------------------------------

    pub fn save_session(&self, session: &Session) -> Result<(), RepositoryError> {
        let json = serde_json::to_string(session)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO sessions (id, data) VALUES (?1, ?2)",
            params![session.id, json],
        )?;
        Ok(())
    }

    pub fn load_all_sessions(&self) -> Result<Vec<Session>, RepositoryError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT data FROM sessions")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut sessions = Vec::new();
        for row in rows {
            let json = row?;
            sessions.push(serde_json::from_str(&json)?);
        }
        Ok(sessions)
    }

    pub fn remove_session(&self, session_id: &str) -> Result<(), RepositoryError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        Ok(())
    }

    pub fn load_session(&self, session_id: &str) -> Result<Option<Session>, RepositoryError> {
        let conn = self.conn.lock().unwrap();
        let json: Option<String> = conn
            .query_row(
                "SELECT data FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
    }

    // ---------------------------------------------------------------
    // Tickets + state history
    // ---------------------------------------------------------------

    pub fn save_ticket(&self, ticket: &Ticket) -> Result<(), RepositoryError> {
        let json = serde_json::to_string(ticket)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO tickets (id, data) VALUES (?1, ?2)",
            params![ticket.id, json],
        )?;
        Ok(())
    }

    pub fn load_ticket(&self, ticket_id: &str) -> Result<Option<Ticket>, RepositoryError> {
        let conn = self.conn.lock().unwrap();
        let json: Option<String> = conn
            .query_row(
                "SELECT data FROM tickets WHERE id = ?1",
                params![ticket_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
    }

    pub fn load_all_tickets(&self) -> Result<Vec<Ticket>, RepositoryError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT data FROM tickets")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut tickets = Vec::new();
        for row in rows {
            tickets.push(serde_json::from_str(&row?)?);
        }
        Ok(tickets)
    }

    /// Append one state-history row for a ticket. `seq` is the caller's
    /// running row count for that ticket (0-based), which doubles as the
    /// contiguity invariant's index.
    pub fn append_state_history(
        &self,
        entry: &StateHistoryEntry,
    ) -> Result<(), RepositoryError> {
        let conn = self.conn.lock().unwrap();
        let seq: i64 = conn.query_row(
            "SELECT COUNT(*) FROM state_history WHERE ticket_id = ?1",
            params![entry.ticket_id],
            |row| row.get(0),
        )?;
        let json = serde_json::to_string(entry)?;
        conn.execute(
            "INSERT INTO state_history (ticket_id, seq, data) VALUES (?1, ?2, ?3)",
            params![entry.ticket_id, seq, json],
        )?;
        Ok(())
    }

    pub fn load_state_history(
        &self,
        ticket_id: &str,
    ) -> Result<Vec<StateHistoryEntry>, RepositoryError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT data FROM state_history WHERE ticket_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![ticket_id], |row| row.get::<_, String>(0))?;
        let mut history = Vec::new();
        for row in rows {
            history.push(serde_json::from_str(&row?)?);
        }
        Ok(history)
    }

    // ---------------------------------------------------------------
    // Notifications
    // ---------------------------------------------------------------

    /// Upsert a notification by its dedup key: if an unread notification
    /// already exists for the same `(owner, kind)`, it is replaced in place
    /// rather than accumulating a duplicate.
    pub fn upsert_notification(&self, notification: &Notification) -> Result<(), RepositoryError> {
        let conn = self.conn.lock().unwrap();

        if let Some((owner, kind)) = notification.dedup_key() {
            let kind_str = serde_json::to_string(&kind)?;
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM notifications \
                     WHERE dedup_owner = ?1 AND dedup_kind = ?2 \
                     AND json_extract(data, '$.read') = 0",
                    params![owner, kind_str],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(existing_id) = existing {
                conn.execute(
                    "DELETE FROM notifications WHERE id = ?1",
                    params![existing_id],
                )?;
            }

            let json = serde_json::to_string(notification)?;
            conn.execute(
                "INSERT INTO notifications (id, dedup_owner, dedup_kind, data) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![notification.id, owner, kind_str, json],
            )?;
        } else {
            let json = serde_json::to_string(notification)?;
            conn.execute(
                "INSERT INTO notifications (id, dedup_owner, dedup_kind, data) \
                 VALUES (?1, NULL, NULL, ?2)",
                params![notification.id, json],
            )?;
        }
        Ok(())
    }

    pub fn load_unread_notifications(&self) -> Result<Vec<Notification>, RepositoryError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT data FROM notifications WHERE json_extract(data, '$.read') = 0")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    pub fn mark_notification_read(&self, notification_id: &str) -> Result<(), RepositoryError> {
        let conn = self.conn.lock().unwrap();
        let json: Option<String> = conn
            .query_row(
                "SELECT data FROM notifications WHERE id = ?1",
                params![notification_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(json) = json else {
            return Err(RepositoryError::NotFound(notification_id.to_string()));
        };
        let mut n: Notification = serde_json::from_str(&json)?;
        n.read = true;
        let updated = serde_json::to_string(&n)?;
        conn.execute(
            "UPDATE notifications SET data = ?1 WHERE id = ?2",
            params![updated, notification_id],
        )?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Review cache
    // ---------------------------------------------------------------

    pub fn save_review_summary(
        &self,
        ticket_id: &str,
        summary: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO review_cache (ticket_id, summary, updated_at) VALUES (?1, ?2, ?3)",
            params![ticket_id, summary, now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn load_review_summary(&self, ticket_id: &str) -> Result<Option<String>, RepositoryError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT summary FROM review_cache WHERE ticket_id = ?1",
                params![ticket_id],
                |row| row.get(0),
            )
            .optional()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ticket() -> Ticket {
        Ticket {
            id: "t1".into(),
            external_id: "CSM-1".into(),
            title: "do thing".into(),
            state: TicketState::Backlog,
            file_path: "tickets/CSM-1.md".into(),
            is_adhoc: false,
            started_at: None,
            completed_at: None,
            rejection_feedback: None,
        }
    }

    fn sample_notification(kind: NotificationKind, ticket_id: &str) -> Notification {
        Notification {
            id: uuid_like(),
            kind,
            message: "hi".into(),
            session_id: None,
            ticket_id: Some(ticket_id.into()),
            read: false,
            created_at: Utc::now(),
        }
    }

    fn uuid_like() -> String {
        format!("n-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
    }

    #[test]
    fn ticket_round_trips() {
        let repo = Repository::open_in_memory().unwrap();
        repo.save_ticket(&sample_ticket()).unwrap();
        let loaded = repo.load_ticket("t1").unwrap().unwrap();
        assert_eq!(loaded.external_id, "CSM-1");
    }

    #[test]
    fn missing_ticket_returns_none() {
        let repo = Repository::open_in_memory().unwrap();
        assert!(repo.load_ticket("nope").unwrap().is_none());
    }

    #[test]
    fn state_history_is_appended_in_order() {
        let repo = Repository::open_in_memory().unwrap();
        for to_state in [TicketState::InProgress, TicketState::Review, TicketState::Done] {
            repo.append_state_history(&StateHistoryEntry {
                ticket_id: "t1".into(),
                from_state: TicketState::Backlog,
                to_state,
                trigger: TransitionTrigger::Manual,
                reason: TransitionReason::UserApproved,
                feedback: None,
                triggered_by: None,
                timestamp: Utc::now(),
            })
            .unwrap();
        }
        let history = repo.load_state_history("t1").unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].to_state, TicketState::InProgress);
        assert_eq!(history[2].to_state, TicketState::Done);
    }

    #[test]
    fn upsert_notification_replaces_unread_same_key() {
        let repo = Repository::open_in_memory().unwrap();
        let first = sample_notification(NotificationKind::ReviewReady, "t1");
        repo.upsert_notification(&first).unwrap();
        let second = sample_notification(NotificationKind::ReviewReady, "t1");
        repo.upsert_notification(&second).unwrap();

        let unread = repo.load_unread_notifications().unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].id, second.id);
    }

    #[test]
    fn upsert_notification_distinct_kinds_both_kept() {
        let repo = Repository::open_in_memory().unwrap();
        repo.upsert_notification(&sample_notification(NotificationKind::ReviewReady, "t1"))
            .unwrap();
        repo.upsert_notification(&sample_notification(NotificationKind::ContextLow, "t1"))
            .unwrap();
        assert_eq!(repo.load_unread_notifications().unwrap().len(), 2);
    }

    #[test]
    fn marking_read_removes_it_from_unread() {
        let repo = Repository::open_in_memory().unwrap();
        let n = sample_notification(NotificationKind::WaitingInput, "t1");
        repo.upsert_notification(&n).unwrap();
        repo.mark_notification_read(&n.id).unwrap();
        assert!(repo.load_unread_notifications().unwrap().is_empty());
    }

    #[test]
    fn review_summary_round_trips() {
        let repo = Repository::open_in_memory().unwrap();
        repo.save_review_summary("t1", "looks good", Utc::now()).unwrap();
        assert_eq!(
            repo.load_review_summary("t1").unwrap(),
            Some("looks good".to_string())
        );
    }

    fn sample_project() -> Project {
        Project {
            id: "p1".into(),
            repo_path: "/repo".into(),
            tmux_session: "work".into(),
            tmux_window: None,
            tickets_path: "/repo/tickets".into(),
            handoff_path: "/repo/.handoff".into(),
        }
    }

    #[test]
    fn project_round_trips() {
        let repo = Repository::open_in_memory().unwrap();
        repo.save_project(&sample_project()).unwrap();
        let loaded = repo.load_project("p1").unwrap().unwrap();
        assert_eq!(loaded.tmux_session, "work");
        assert_eq!(repo.load_all_projects().unwrap().len(), 1);
    }

    #[test]
    fn missing_project_returns_none() {
        let repo = Repository::open_in_memory().unwrap();
        assert!(repo.load_project("nope").unwrap().is_none());
    }

    #[test]
    fn handoff_event_round_trips_by_from_session() {
        let repo = Repository::open_in_memory().unwrap();
        let event = HandoffEvent {
            id: "h1".into(),
            from_session_id: "s1".into(),
            to_session_id: "s2".into(),
            ticket_id: "t1".into(),
            context_at_handoff: 92,
            created_at: Utc::now(),
        };
        repo.save_handoff_event(&event).unwrap();
        let loaded = repo.load_handoff_events_for_session("s1").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].to_session_id, "s2");
        assert!(repo.load_handoff_events_for_session("other").unwrap().is_empty());
    }
}
