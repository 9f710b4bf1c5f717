use thiserror::Error;

/// Failures surfaced by the terminal multiplexer adapter.
#[derive(Debug, Error)]
pub enum MuxError {
    /// The `tmux` binary could not be located or invoked at all.
    #[error("tmux is unavailable: {0}")]
    MuxUnavailable(String),

    /// A command targeted a pane id that tmux no longer recognizes.
    #[error("pane not found: {0}")]
    PaneNotFound(String),

    /// tmux ran but returned a non-zero exit status.
    #[error("tmux command failed: {0}")]
    MuxCommandFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),
}
