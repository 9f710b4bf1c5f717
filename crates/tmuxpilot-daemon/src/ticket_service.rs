use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use tmuxpilot_core::domain::{StateHistoryEntry, Ticket, TicketState, TransitionReason, TransitionTrigger};
use tmuxpilot_core::error::TicketError;
use tmuxpilot_core::ticket;

use crate::error::RepositoryError;
use crate::event_bus::{Event, EventBus};
use crate::repository::Repository;
use crate::supervisor::Supervisor;

#[derive(Debug, Error)]
pub enum TicketServiceError {
    #[error(transparent)]
    Ticket(#[from] TicketError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("ticket not found: {0}")]
    NotFound(String),
}

/// Owns every mutation of ticket state: validates the transition against
/// the pure state machine, persists the new row plus its history entry, and
/// publishes the result on the event bus in one place so every caller (CLI,
/// hub RPC, auto-handoff controller) goes through the same path.
pub struct TicketService {
    repo: Arc<Repository>,
    events: EventBus,
    supervisor: Option<Arc<Supervisor>>,
}

impl TicketService {
    pub fn new(repo: Arc<Repository>, events: EventBus) -> Self {
        Self { repo, events, supervisor: None }
    }

    /// Wire in the supervisor so a rejection can also reach a still-running
    /// session for the ticket, not just the persisted ticket row.
    pub fn with_supervisor(mut self, supervisor: Arc<Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    fn get(&self, ticket_id: &str) -> Result<Ticket, TicketServiceError> {
        self.repo
            .load_ticket(ticket_id)?
            .ok_or_else(|| TicketServiceError::NotFound(ticket_id.to_string()))
    }

    fn apply(
        &self,
        ticket_id: &str,
        to_state: TicketState,
        trigger: TransitionTrigger,
        reason: TransitionReason,
        feedback: Option<&str>,
        triggered_by: Option<&str>,
    ) -> Result<Ticket, TicketServiceError> {
        let mut current = self.get(ticket_id)?;
        let now = Utc::now();
        let transition = ticket::transition(&current, to_state, trigger, reason, feedback, now)?;

        if let Some(state) = transition.patch.state {
            current.state = state;
        }
        if let Some(started_at) = transition.patch.started_at {
            current.started_at = Some(started_at);
        }
        if let Some(completed_at) = transition.patch.completed_at {
            current.completed_at = completed_at;
        }
        if let Some(rejection_feedback) = transition.patch.rejection_feedback {
            current.rejection_feedback = rejection_feedback;
        }

        self.repo.save_ticket(&current)?;
        self.repo.append_state_history(&StateHistoryEntry {
            ticket_id: current.id.clone(),
            from_state: transition.from_state,
            to_state: transition.to_state,
            trigger: transition.trigger,
            reason: transition.reason,
            feedback: transition.feedback,
            triggered_by: triggered_by.map(|s| s.to_string()),
            timestamp: now,
        })?;

        self.events.publish(Event::TicketChanged {
            ticket: current.clone(),
        });
        Ok(current)
    }

    pub fn approve(&self, ticket_id: &str, triggered_by: &str) -> Result<Ticket, TicketServiceError> {
        self.apply(
            ticket_id,
            TicketState::Done,
            TransitionTrigger::Manual,
            TransitionReason::UserApproved,
            None,
            Some(triggered_by),
        )
    }

    /// Reject a ticket in review, returning it to `in_progress`. If a
    /// session is currently running for this ticket, the formatted feedback
    /// is also delivered to it as input, so the agent sees the rejection
    /// without anyone re-attaching a terminal.
    pub async fn reject(
        &self,
        ticket_id: &str,
        feedback: &str,
        triggered_by: &str,
    ) -> Result<Ticket, TicketServiceError> {
        let ticket = self.apply(
            ticket_id,
            TicketState::InProgress,
            TransitionTrigger::Manual,
            TransitionReason::UserRejected,
            Some(feedback),
            Some(triggered_by),
        )?;

        if let Some(supervisor) = &self.supervisor {
            if let Some(formatted) = &ticket.rejection_feedback {
                if let Some(session) = supervisor.running_session_for_ticket(ticket_id).await {
                    if let Err(e) = supervisor.send_input(&session.id, formatted).await {
                        tracing::warn!(
                            ticket_id,
                            session_id = %session.id,
                            error = %e,
                            "failed to deliver rejection feedback to running session"
                        );
                    }
                }
            }
        }

        Ok(ticket)
    }

    pub fn pause(&self, ticket_id: &str, triggered_by: &str) -> Result<Ticket, TicketServiceError> {
        self.apply(
            ticket_id,
            TicketState::Backlog,
            TransitionTrigger::Manual,
            TransitionReason::UserPaused,
            None,
            Some(triggered_by),
        )
    }

    pub fn start_work(&self, ticket_id: &str) -> Result<Ticket, TicketServiceError> {
        self.apply(
            ticket_id,
            TicketState::InProgress,
            TransitionTrigger::Auto,
            TransitionReason::SessionStarted,
            None,
            None,
        )
    }

    pub fn move_to_review(&self, ticket_id: &str) -> Result<Ticket, TicketServiceError> {
        self.apply(
            ticket_id,
            TicketState::Review,
            TransitionTrigger::Auto,
            TransitionReason::CompletionDetected,
            None,
            None,
        )
    }

    pub fn reopen(&self, ticket_id: &str, triggered_by: &str) -> Result<Ticket, TicketServiceError> {
        self.apply(
            ticket_id,
            TicketState::InProgress,
            TransitionTrigger::Manual,
            TransitionReason::ReOpened,
            None,
            Some(triggered_by),
        )
    }

    pub fn history(&self, ticket_id: &str) -> Result<Vec<StateHistoryEntry>, TicketServiceError> {
        Ok(self.repo.load_state_history(ticket_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (TicketService, Arc<Repository>) {
        let repo = Arc::new(Repository::open_in_memory().unwrap());
        let events = EventBus::default();
        repo.save_ticket(&Ticket {
            id: "t1".into(),
            external_id: "CSM-1".into(),
            title: "do thing".into(),
            state: TicketState::Backlog,
            file_path: "tickets/CSM-1.md".into(),
            is_adhoc: false,
            started_at: None,
            completed_at: None,
            rejection_feedback: None,
        })
        .unwrap();
        (TicketService::new(repo.clone(), events), repo)
    }

    #[test]
    fn start_work_then_review_then_approve_persists_and_records_history() {
        let (svc, repo) = service();
        svc.start_work("t1").unwrap();
        svc.move_to_review("t1").unwrap();
        let approved = svc.approve("t1", "alice").unwrap();
        assert_eq!(approved.state, TicketState::Done);
        assert!(approved.completed_at.is_some());

        let history = svc.history("t1").unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].reason, TransitionReason::UserApproved);

        let persisted = repo.load_ticket("t1").unwrap().unwrap();
        assert_eq!(persisted.state, TicketState::Done);
    }

    #[tokio::test]
    async fn reject_without_feedback_fails_and_leaves_state_untouched() {
        let (svc, repo) = service();
        svc.start_work("t1").unwrap();
        svc.move_to_review("t1").unwrap();
        let err = svc.reject("t1", "", "alice").await.unwrap_err();
        assert!(matches!(err, TicketServiceError::Ticket(TicketError::MissingFeedback)));
        assert_eq!(repo.load_ticket("t1").unwrap().unwrap().state, TicketState::Review);
    }

    #[tokio::test]
    async fn reject_with_feedback_returns_to_in_progress_and_stores_formatted_feedback() {
        let (svc, repo) = service();
        svc.start_work("t1").unwrap();
        svc.move_to_review("t1").unwrap();
        let rejected = svc.reject("t1", "please add tests", "alice").await.unwrap();
        assert_eq!(rejected.state, TicketState::InProgress);
        assert!(rejected.rejection_feedback.unwrap().contains("please add tests"));
        assert_eq!(repo.load_ticket("t1").unwrap().unwrap().state, TicketState::InProgress);
    }

    #[test]
    fn events_are_published_on_transition() {
        let events = EventBus::default();
        let repo = Arc::new(Repository::open_in_memory().unwrap());
        repo.save_ticket(&Ticket {
            id: "t1".into(),
            external_id: "CSM-1".into(),
            title: "do thing".into(),
            state: TicketState::Backlog,
            file_path: "tickets/CSM-1.md".into(),
            is_adhoc: false,
            started_at: None,
            completed_at: None,
            rejection_feedback: None,
        })
        .unwrap();
        let svc = TicketService::new(repo, events.clone());
        let mut rx = events.subscribe();
        svc.start_work("t1").unwrap();
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, Event::TicketChanged { ticket } if ticket.state == TicketState::InProgress));
    }
}
