use thiserror::Error;

use crate::domain::TicketState;

/// Failures raised by the pure ticket state machine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TicketError {
    #[error("cannot transition ticket from {from_state} to {to_state}")]
    InvalidTransition {
        from_state: TicketState,
        to_state: TicketState,
    },
    #[error("rejecting a ticket requires non-empty feedback")]
    MissingFeedback,
}

/// Failures raised while parsing an agent transcript entry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TranscriptError {
    #[error("malformed transcript line: {0}")]
    MalformedLine(String),
}
