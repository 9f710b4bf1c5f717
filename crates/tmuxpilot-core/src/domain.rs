use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `type` discriminant for a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Adhoc,
    Ticket,
}

/// Lifecycle status of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Paused,
    Completed,
    Error,
}

/// A managed run of a coding agent, bound to a multiplexer pane.
///
/// Exclusively owned by the Session Supervisor while live; the persisted
/// row is shared read-only with the rest of the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub ticket_id: Option<String>,
    pub parent_session_id: Option<String>,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub pane_id: Option<String>,
    pub context_percent: u8,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// External entity the core reads by reference; owned by the repository
/// collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub repo_path: String,
    pub tmux_session: String,
    pub tmux_window: Option<String>,
    pub tickets_path: String,
    pub handoff_path: String,
}

/// Ticket state-machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    Backlog,
    InProgress,
    Review,
    Done,
}

impl std::fmt::Display for TicketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TicketState::Backlog => "backlog",
            TicketState::InProgress => "in_progress",
            TicketState::Review => "review",
            TicketState::Done => "done",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub external_id: String,
    pub title: String,
    pub state: TicketState,
    pub file_path: String,
    pub is_adhoc: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rejection_feedback: Option<String>,
}

/// Why a ticket transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionTrigger {
    Manual,
    Auto,
}

/// The specific reason within a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    UserApproved,
    UserRejected,
    UserPaused,
    ReOpened,
    SessionStarted,
    CompletionDetected,
}

/// Append-only audit row. Invariant: for a given ticket, row N's `to_state`
/// equals row N+1's `from_state`, and row 0's `from_state` is `Backlog`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    pub ticket_id: String,
    pub from_state: TicketState,
    pub to_state: TicketState,
    pub trigger: TransitionTrigger,
    pub reason: TransitionReason,
    pub feedback: Option<String>,
    pub triggered_by: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Notification kinds that participate in the upsert-by-key invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    WaitingInput,
    ContextLow,
    ReviewReady,
    HandoffComplete,
    HandoffFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    pub message: String,
    pub session_id: Option<String>,
    pub ticket_id: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// The dedup key used by the upsert-by-key invariant: at most one
    /// unread notification per `(owner, kind)` pair, where `owner` is the
    /// ticket id when present, else the session id.
    pub fn dedup_key(&self) -> Option<(String, NotificationKind)> {
        let owner = self.ticket_id.clone().or_else(|| self.session_id.clone())?;
        Some((owner, self.kind))
    }
}

/// A single JSONL record emitted by the agent transcript.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranscriptEntry {
    #[serde(default)]
    pub usage: Option<TranscriptUsage>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub content: Vec<TranscriptContentBlock>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TranscriptUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptContentBlock {
    Text { text: String },
    ToolUse {
        #[serde(default)]
        name: Option<String>,
    },
    #[serde(other)]
    Other,
}

/// Derived agent state from a single transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaudeState {
    ContextExhausted,
    Completed,
    WaitingApproval,
    Active,
    Unknown,
}

/// Context Monitor's per-session bookkeeping, owned internally by the monitor.
#[derive(Debug, Clone)]
pub struct MonitoredSession {
    pub session_id: String,
    pub transcript_path: std::path::PathBuf,
    pub file_position: u64,
    pub context_percent: u8,
    pub total_tokens: u64,
    pub claude_state: ClaudeState,
    pub last_usage: Option<TranscriptUsage>,
    pub threshold_notified: bool,
}

/// Best-effort reason credited to a waiting-state emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitingReason {
    Stopped,
    PermissionPrompt,
    IdlePrompt,
    ContextExhausted,
    Question,
    Unknown,
}

/// Waiting Detector's per-session bookkeeping, owned internally by the detector.
#[derive(Debug, Clone)]
pub struct WaitingSessionState {
    pub session_id: String,
    pub is_waiting: bool,
    pub last_reason: WaitingReason,
    pub last_signal_time: DateTime<Utc>,
    pub last_output_time: DateTime<Utc>,
    pub threshold_notified: bool,
}

/// Audit row for a completed handoff. Exactly one row is persisted
/// per `handoff:completed` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffEvent {
    pub id: String,
    pub from_session_id: String,
    pub to_session_id: String,
    pub ticket_id: String,
    pub context_at_handoff: u8,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_dedup_key_prefers_ticket() {
        let n = Notification {
            id: "n1".into(),
            kind: NotificationKind::ReviewReady,
            message: "m".into(),
            session_id: Some("s1".into()),
            ticket_id: Some("t1".into()),
            read: false,
            created_at: Utc::now(),
        };
        assert_eq!(
            n.dedup_key(),
            Some(("t1".to_string(), NotificationKind::ReviewReady))
        );
    }

    #[test]
    fn notification_dedup_key_falls_back_to_session() {
        let n = Notification {
            id: "n1".into(),
            kind: NotificationKind::ContextLow,
            message: "m".into(),
            session_id: Some("s1".into()),
            ticket_id: None,
            read: false,
            created_at: Utc::now(),
        };
        assert_eq!(
            n.dedup_key(),
            Some(("s1".to_string(), NotificationKind::ContextLow))
        );
    }

    #[test]
    fn notification_dedup_key_none_without_owner() {
        let n = Notification {
            id: "n1".into(),
            kind: NotificationKind::ContextLow,
            message: "m".into(),
            session_id: None,
            ticket_id: None,
            read: false,
            created_at: Utc::now(),
        };
        assert_eq!(n.dedup_key(), None);
    }

    #[test]
    fn ticket_state_display() {
        assert_eq!(TicketState::InProgress.to_string(), "in_progress");
    }
}
