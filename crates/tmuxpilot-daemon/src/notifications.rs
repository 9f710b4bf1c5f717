use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;

use tmuxpilot_core::domain::{Notification, NotificationKind};

use crate::error::RepositoryError;
use crate::event_bus::{Event, EventBus};
use crate::repository::Repository;

/// Monotonic counter used to keep notification ids unique even when two are
/// minted within the same clock tick.
static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_id() -> String {
    let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("notif-{}-{seq}", Utc::now().timestamp_millis())
}

/// Raises and stores notifications, enforcing the upsert-by-key invariant
/// for `waiting_input`, `context_low` and `review_ready` (at most one unread
/// notification per owning session/ticket) via the repository layer, and
/// broadcasting every created notification on the event bus for the
/// fan-out hub to push to subscribers.
pub struct NotificationService {
    repo: Arc<Repository>,
    events: EventBus,
}

impl NotificationService {
    pub fn new(repo: Arc<Repository>, events: EventBus) -> Self {
        Self { repo, events }
    }

    pub fn raise(
        &self,
        kind: NotificationKind,
        message: impl Into<String>,
        session_id: Option<String>,
        ticket_id: Option<String>,
    ) -> Result<Notification, RepositoryError> {
        let notification = Notification {
            id: next_id(),
            kind,
            message: message.into(),
            session_id,
            ticket_id,
            read: false,
            created_at: Utc::now(),
        };
        self.repo.upsert_notification(&notification)?;
        self.events.publish(Event::NotificationCreated {
            notification: notification.clone(),
        });
        Ok(notification)
    }

    pub fn mark_read(&self, notification_id: &str) -> Result<(), RepositoryError> {
        self.repo.mark_notification_read(notification_id)
    }

    pub fn unread(&self) -> Result<Vec<Notification>, RepositoryError> {
        self.repo.load_unread_notifications()
    }
}
