use chrono::{DateTime, Utc};

use crate::domain::{Ticket, TicketState, TransitionReason, TransitionTrigger};
use crate::error::TicketError;

/// The canonical header/footer the rejection-feedback formatter sandwiches
/// user text between. Exact layout is an implementation detail; the only
/// contract is that it is a deterministic function of the input string.
const FEEDBACK_HEADER: &str = "--- Reviewer feedback ---";
const FEEDBACK_FOOTER: &str = "--- end feedback ---";

/// Format rejection feedback into its canonical persisted form.
pub fn format_rejection_feedback(raw: &str) -> String {
    format!("{FEEDBACK_HEADER}\n{}\n{FEEDBACK_FOOTER}", raw.trim())
}

/// The side effects a successful transition applies to the ticket row,
/// expressed as field deltas so the caller can apply them inside whatever
/// transaction the repository collaborator provides.
#[derive(Debug, Clone, Default)]
pub struct TicketPatch {
    pub state: Option<TicketState>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub rejection_feedback: Option<Option<String>>,
}

/// A validated transition, ready to be persisted alongside a
/// [`crate::domain::StateHistoryEntry`] in a single transaction.
#[derive(Debug, Clone)]
pub struct TicketTransition {
    pub from_state: TicketState,
    pub to_state: TicketState,
    pub trigger: TransitionTrigger,
    pub reason: TransitionReason,
    pub feedback: Option<String>,
    pub patch: TicketPatch,
}

/// Validate and compute the side effects of a requested transition. Pure:
/// takes the ticket's current state plus the request, returns either the
/// transition to apply or the specific rejection.
///
/// This is the sole authority on which `(from, to)` pairs are legal — see
/// the allowed-transition table.
pub fn transition(
    ticket: &Ticket,
    to_state: TicketState,
    trigger: TransitionTrigger,
    reason: TransitionReason,
    feedback: Option<&str>,
    now: DateTime<Utc>,
) -> Result<TicketTransition, TicketError> {
    use TicketState::*;

    let from_state = ticket.state;
    let allowed = matches!(
        (from_state, to_state),
        (Backlog, InProgress)
            | (InProgress, Review)
            | (InProgress, Backlog)
            | (Review, Done)
            | (Review, InProgress)
            | (Done, InProgress)
    );
    if !allowed {
        return Err(TicketError::InvalidTransition { from_state, to_state });
    }

    if matches!(reason, TransitionReason::UserRejected) && feedback.unwrap_or("").trim().is_empty()
    {
        return Err(TicketError::MissingFeedback);
    }

    let mut patch = TicketPatch {
        state: Some(to_state),
        ..Default::default()
    };

    if from_state == Backlog && to_state == InProgress {
        patch.started_at = Some(now);
        patch.rejection_feedback = Some(None);
    }
    if to_state == Done {
        patch.completed_at = Some(Some(now));
    }
    if from_state == Done {
        patch.completed_at = Some(None);
    }

    let formatted_feedback = if from_state == Review
        && to_state == InProgress
        && matches!(reason, TransitionReason::UserRejected)
    {
        let formatted = format_rejection_feedback(feedback.unwrap_or_default());
        patch.rejection_feedback = Some(Some(formatted.clone()));
        Some(formatted)
    } else {
        if patch.rejection_feedback.is_none() {
            patch.rejection_feedback = Some(None);
        }
        None
    };

    Ok(TicketTransition {
        from_state,
        to_state,
        trigger,
        reason,
        feedback: formatted_feedback,
        patch,
    })
}

/// `approve(id)` convenience: `review -> done`, manual, user_approved.
pub fn approve(ticket: &Ticket, now: DateTime<Utc>) -> Result<TicketTransition, TicketError> {
    transition(
        ticket,
        TicketState::Done,
        TransitionTrigger::Manual,
        TransitionReason::UserApproved,
        None,
        now,
    )
}

/// `reject(id, feedback)` convenience: `review -> in_progress`, manual, user_rejected.
pub fn reject(
    ticket: &Ticket,
    feedback: &str,
    now: DateTime<Utc>,
) -> Result<TicketTransition, TicketError> {
    transition(
        ticket,
        TicketState::InProgress,
        TransitionTrigger::Manual,
        TransitionReason::UserRejected,
        Some(feedback),
        now,
    )
}

/// `startWork(id, sessionId)` convenience: `backlog -> in_progress`, auto, session_started.
pub fn start_work(ticket: &Ticket, now: DateTime<Utc>) -> Result<TicketTransition, TicketError> {
    transition(
        ticket,
        TicketState::InProgress,
        TransitionTrigger::Auto,
        TransitionReason::SessionStarted,
        None,
        now,
    )
}

/// `moveToReview(id, sessionId?)` convenience: `in_progress -> review`, auto, completion_detected.
pub fn move_to_review(ticket: &Ticket, now: DateTime<Utc>) -> Result<TicketTransition, TicketError> {
    transition(
        ticket,
        TicketState::Review,
        TransitionTrigger::Auto,
        TransitionReason::CompletionDetected,
        None,
        now,
    )
}

/// Verify the chain invariant over a ticket's full history: row N's
/// `to_state` equals row N+1's `from_state`, and row 0 starts at `backlog`.
pub fn history_is_contiguous(rows: &[crate::domain::StateHistoryEntry]) -> bool {
    if let Some(first) = rows.first() {
        if first.from_state != TicketState::Backlog {
            return false;
        }
    }
    rows.windows(2).all(|w| w[0].to_state == w[1].from_state)
}
