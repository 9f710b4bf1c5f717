use chrono::{DateTime, Utc};

use crate::domain::{ClaudeState, WaitingReason, WaitingSessionState};

/// Hook event names that map to [`WaitingReason::PermissionPrompt`].
const APPROVAL_EVENTS: &[&str] = &["approval", "waiting_approval", "needsapproval", "permission"];
/// Hook event names that map to [`WaitingReason::IdlePrompt`].
const IDLE_EVENTS: &[&str] = &["waiting_input", "needsinput", "idle"];
/// Hook event names that map to [`WaitingReason::Question`].
const QUESTION_EVENTS: &[&str] = &["question", "needsanswer"];
/// Hook event names that map to [`WaitingReason::Stopped`].
const STOP_EVENTS: &[&str] = &["stop", "stopped", "done"];

/// Output substrings that indicate the agent is blocked on a yes/no prompt.
const PERMISSION_PROMPT_MARKERS: &[&str] = &[
    "Do you want to proceed",
    "(y/n)",
    "Allow this action",
];
/// Output substrings that indicate an idle `>` style prompt is showing.
const IDLE_PROMPT_MARKERS: &[&str] = &["Human:", "> "];

/// Map a raw hook event name to the reason it signals, if any. Matching is
/// substring-based and case-insensitive so minor naming drift across hook
/// payload versions doesn't silently stop being recognized.
pub fn hook_event_to_waiting_reason(event_name: &str) -> Option<WaitingReason> {
    let lower = event_name.to_ascii_lowercase();
    let matches_any = |set: &[&str]| set.iter().any(|needle| lower.contains(needle));

    if matches_any(APPROVAL_EVENTS) {
        Some(WaitingReason::PermissionPrompt)
    } else if matches_any(QUESTION_EVENTS) {
        Some(WaitingReason::Question)
    } else if matches_any(IDLE_EVENTS) {
        Some(WaitingReason::IdlePrompt)
    } else if matches_any(STOP_EVENTS) {
        Some(WaitingReason::Stopped)
    } else {
        None
    }
}

/// Map a parsed transcript state to a waiting reason. `Active`, `Completed`
/// and `Unknown` are not themselves waiting signals.
pub fn claude_state_to_waiting_reason(state: ClaudeState) -> Option<WaitingReason> {
    match state {
        ClaudeState::ContextExhausted => Some(WaitingReason::ContextExhausted),
        ClaudeState::WaitingApproval => Some(WaitingReason::PermissionPrompt),
        ClaudeState::Completed | ClaudeState::Active | ClaudeState::Unknown => None,
    }
}

/// Scan the most recent output lines (oldest first, as returned by
/// [`crate::ring_buffer::RingBuffer::last_n`]) for a recognizable prompt.
/// Only the tail is meaningful, so scanning is done newest-first.
pub fn detect_output_pattern(recent_lines: &[String]) -> Option<WaitingReason> {
    for line in recent_lines.iter().rev() {
        if PERMISSION_PROMPT_MARKERS.iter().any(|m| line.contains(m)) {
            return Some(WaitingReason::PermissionPrompt);
        }
        if IDLE_PROMPT_MARKERS.iter().any(|m| line.contains(m)) {
            return Some(WaitingReason::IdlePrompt);
        }
    }
    None
}

/// Consolidate the three independent signal sources into a single verdict.
///
/// Precedence: a hook event is the most direct signal and wins outright;
/// failing that, the parsed transcript state; failing that, a pattern match
/// against recent terminal output. Absence of all three signals clears the
/// waiting state rather than leaving it stale.
pub fn consolidate(
    current: &WaitingSessionState,
    hook_reason: Option<WaitingReason>,
    transcript_state: Option<ClaudeState>,
    recent_output_lines: &[String],
    now: DateTime<Utc>,
) -> WaitingSessionState {
    let transcript_reason = transcript_state.and_then(claude_state_to_waiting_reason);
    let output_reason = detect_output_pattern(recent_output_lines);
    let resolved = hook_reason.or(transcript_reason).or(output_reason);

    match resolved {
        Some(reason) => WaitingSessionState {
            session_id: current.session_id.clone(),
            is_waiting: true,
            last_reason: reason,
            last_signal_time: now,
            last_output_time: current.last_output_time,
            threshold_notified: current.threshold_notified,
        },
        None => WaitingSessionState {
            session_id: current.session_id.clone(),
            is_waiting: false,
            last_reason: current.last_reason,
            last_signal_time: current.last_signal_time,
            last_output_time: now,
            threshold_notified: false,
        },
    }
}
