use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Mux(#[from] tmuxpilot_mux::MuxError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("project not found: {0}")]
    ProjectNotFound(String),
    #[error("ticket not found: {0}")]
    TicketNotFound(String),
    #[error("session already running for ticket: {0}")]
    AlreadyRunning(String),
    #[error("session is not running: {0}")]
    NotRunning(String),
    #[error("session pane id is a placeholder, not a real pane: {0}")]
    InvalidPane(String),
    #[error("failed to create session: {0}")]
    CreationFailed(String),
    #[error("failed to deliver input: {0}")]
    InputFailed(String),
}

#[derive(Debug, Error)]
pub enum ReviewerError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("ticket not in review: {0}")]
    NotInReview(String),
    #[error("a review is already running for session: {0}")]
    ReviewInProgress(String),
    #[error("reviewer binary not found: {0}")]
    ReviewerBinaryMissing(String),
    #[error("reviewer timed out after {0:?}")]
    ReviewTimeout(std::time::Duration),
    #[error("review was cancelled")]
    ReviewCancelled,
    #[error("reviewer process failed: {0}")]
    ReviewExecutionError(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error(transparent)]
    Mux(#[from] tmuxpilot_mux::MuxError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("source session has no active ticket: {0}")]
    NoActiveTicket(String),
    #[error("a handoff is already in progress for session: {0}")]
    HandoffInProgress(String),
    #[error("session is not an eligible ticket session: {0}")]
    NotEligible(String),
    #[error("timed out waiting for the handoff file to appear")]
    HandoffTimeout,
    #[error("handoff was cancelled")]
    HandoffCancelled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("rate limit exceeded for connection {0}")]
    RateLimited(String),
    #[error("malformed message: {0}")]
    ParseError(String),
    #[error("unrecognized message shape: {0}")]
    InvalidMessage(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("not subscribed to session: {0}")]
    NotSubscribed(String),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("pty already attached for connection")]
    PtyAlreadyAttached,
    #[error("pty not attached for connection")]
    PtyNotAttached,
    #[error("pane id is invalid or dead")]
    PtyInvalidPane,
    #[error("failed to attach pty: {0}")]
    PtyAttachFailed(String),
    #[error("pty bridge unavailable: {0}")]
    PtyUnavailable(String),
}

#[derive(Debug, Error)]
pub enum TtydError {
    #[error("no free port found starting from {0}")]
    NoFreePort(u16),
    #[error("failed to spawn ttyd: {0}")]
    SpawnFailed(String),
    #[error("ttyd did not become ready within the timeout")]
    ReadinessTimeout,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("row not found: {0}")]
    NotFound(String),
}
