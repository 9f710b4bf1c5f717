use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use tmuxpilot_core::domain::{NotificationKind, WaitingReason, WaitingSessionState};
use tmuxpilot_core::waiting;

use crate::context_monitor::ContextMonitor;
use crate::event_bus::{Event, EventBus};
use crate::notifications::NotificationService;
use crate::supervisor::Supervisor;

struct Tracked {
    state: WaitingSessionState,
    /// A hook event is edge-triggered: it is considered at most once, in
    /// the evaluation immediately following it, then cleared.
    pending_hook_reason: Option<WaitingReason>,
}

fn fresh_state(session_id: &str) -> WaitingSessionState {
    let now = Utc::now();
    WaitingSessionState {
        session_id: session_id.to_string(),
        is_waiting: false,
        last_reason: WaitingReason::Unknown,
        last_signal_time: now,
        last_output_time: now,
        threshold_notified: false,
    }
}

/// Consolidates the three waiting signals (hook events, parsed transcript
/// state, recent pane output) into one verdict per session and raises
/// `waiting_input` the first time a session starts waiting.
pub struct WaitingDetector {
    supervisor: Arc<Supervisor>,
    context_monitor: Arc<ContextMonitor>,
    notifications: Arc<NotificationService>,
    events: EventBus,
    tracked: RwLock<HashMap<String, Tracked>>,
}

impl WaitingDetector {
    pub fn new(
        supervisor: Arc<Supervisor>,
        context_monitor: Arc<ContextMonitor>,
        notifications: Arc<NotificationService>,
        events: EventBus,
    ) -> Self {
        Self {
            supervisor,
            context_monitor,
            notifications,
            events,
            tracked: RwLock::new(HashMap::new()),
        }
    }

    /// Feed in a hook-reported event name for a session, then re-evaluate
    /// immediately — a hook signal should not wait out the next poll tick.
    pub async fn record_hook_event(&self, session_id: &str, event_name: &str) {
        let reason = waiting::hook_event_to_waiting_reason(event_name);
        {
            let mut tracked = self.tracked.write().await;
            let entry = tracked
                .entry(session_id.to_string())
                .or_insert_with(|| Tracked {
                    state: fresh_state(session_id),
                    pending_hook_reason: None,
                });
            entry.pending_hook_reason = reason;
        }
        self.evaluate(session_id).await;
    }

    pub async fn is_waiting(&self, session_id: &str) -> bool {
        self.tracked
            .read()
            .await
            .get(session_id)
            .map(|t| t.state.is_waiting)
            .unwrap_or(false)
    }

    async fn evaluate(&self, session_id: &str) {
        let transcript_state = self.context_monitor.claude_state(session_id).await;
        let recent_output = self.supervisor.recent_output(session_id, 20).await;
        let now = Utc::now();

        let mut tracked = self.tracked.write().await;
        let entry = tracked
            .entry(session_id.to_string())
            .or_insert_with(|| Tracked {
                state: fresh_state(session_id),
                pending_hook_reason: None,
            });

        let hook_reason = entry.pending_hook_reason.take();
        let next = waiting::consolidate(&entry.state, hook_reason, transcript_state, &recent_output, now);
        let became_waiting = next.is_waiting && !entry.state.is_waiting;
        let changed = next.is_waiting != entry.state.is_waiting || next.last_reason != entry.state.last_reason;
        entry.state = next.clone();
        drop(tracked);

        if changed {
            self.events.publish(Event::WaitingStateChanged {
                session_id: session_id.to_string(),
                is_waiting: next.is_waiting,
                reason: format!("{:?}", next.last_reason),
            });
        }

        if became_waiting && !matches!(next.last_reason, WaitingReason::ContextExhausted) {
            if let Err(e) = self.notifications.raise(
                NotificationKind::WaitingInput,
                waiting_message(next.last_reason),
                Some(session_id.to_string()),
                None,
            ) {
                tracing::warn!(%e, session_id, "failed to raise waiting_input notification");
            }
        }
    }

    async fn evaluate_all(&self) {
        let ids: Vec<String> = self.tracked.read().await.keys().cloned().collect();
        for id in ids {
            self.evaluate(&id).await;
        }
    }

    pub async fn run(&self, cancel: CancellationToken, poll_interval: Duration) {
        let mut interval = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.evaluate_all().await;
                }
                _ = cancel.cancelled() => {
                    tracing::info!("waiting detector: shutting down");
                    break;
                }
            }
        }
    }
}

fn waiting_message(reason: WaitingReason) -> &'static str {
    match reason {
        WaitingReason::Stopped => "session stopped",
        WaitingReason::PermissionPrompt => "waiting on a permission prompt",
        WaitingReason::IdlePrompt => "waiting at an idle prompt",
        WaitingReason::ContextExhausted => "context exhausted",
        WaitingReason::Question => "waiting on a question",
        WaitingReason::Unknown => "waiting (unrecognized signal)",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::Repository;
    use std::sync::Arc;

    fn build() -> (WaitingDetector, Arc<NotificationService>) {
        let repo = Arc::new(Repository::open_in_memory().unwrap());
        let events = EventBus::default();
        let notifications = Arc::new(NotificationService::new(repo, events.clone()));
        let supervisor = Arc::new(Supervisor::new(
            Arc::new(tmuxpilot_mux::TmuxAdapter::new()),
            Arc::new(Repository::open_in_memory().unwrap()),
            events.clone(),
            Duration::from_secs(5),
        ));
        let context_monitor = Arc::new(ContextMonitor::new(
            events.clone(),
            notifications.clone(),
            supervisor.clone(),
            20,
            Duration::from_secs(5),
        ));
        (
            WaitingDetector::new(supervisor, context_monitor, notifications.clone(), events),
            notifications,
        )
    }

    #[tokio::test]
    async fn hook_event_flips_to_waiting_and_notifies() {
        let (detector, notifications) = build();
        detector.record_hook_event("s1", "PreToolUse:NeedsApproval").await;
        assert!(detector.is_waiting("s1").await);
        assert_eq!(notifications.unread().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn repeated_same_reason_does_not_renotify() {
        let (detector, notifications) = build();
        detector.record_hook_event("s1", "approval_needed").await;
        detector.record_hook_event("s1", "approval_needed").await;
        assert_eq!(notifications.unread().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_waiting_hook_event_clears_waiting_state() {
        let (detector, _notifications) = build();
        detector.record_hook_event("s1", "approval_needed").await;
        assert!(detector.is_waiting("s1").await);
        detector.record_hook_event("s1", "PostToolUse").await;
        assert!(!detector.is_waiting("s1").await);
    }
}
