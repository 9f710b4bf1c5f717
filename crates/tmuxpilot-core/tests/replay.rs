//! Step-by-step replay of multi-signal sessions through
//! `waiting::consolidate`, mirroring how the Waiting Detector actor folds
//! one signal at a time over a session's lifetime rather than evaluating
//! every input in isolation.

use chrono::Utc;
use tmuxpilot_core::domain::{ClaudeState, WaitingReason, WaitingSessionState};
use tmuxpilot_core::waiting::consolidate;

struct Step {
    hook: Option<WaitingReason>,
    transcript: Option<ClaudeState>,
    output: &'static [&'static str],
    expect_waiting: bool,
    expect_reason: Option<WaitingReason>,
}

fn initial(session_id: &str) -> WaitingSessionState {
    WaitingSessionState {
        session_id: session_id.into(),
        is_waiting: false,
        last_reason: WaitingReason::Unknown,
        last_signal_time: Utc::now(),
        last_output_time: Utc::now(),
        threshold_notified: false,
    }
}

fn run_scenario(session_id: &str, steps: &[Step]) {
    let mut state = initial(session_id);
    for (i, step) in steps.iter().enumerate() {
        let lines: Vec<String> = step.output.iter().map(|s| s.to_string()).collect();
        state = consolidate(&state, step.hook, step.transcript, &lines, Utc::now());
        assert_eq!(
            state.is_waiting, step.expect_waiting,
            "step {i} in scenario {session_id}: expected is_waiting={}",
            step.expect_waiting
        );
        if let Some(reason) = step.expect_reason {
            assert_eq!(
                state.last_reason, reason,
                "step {i} in scenario {session_id}: expected reason {reason:?}"
            );
        }
    }
}

#[test]
fn ticket_session_runs_to_approval_then_clears_on_stop() {
    // Agent works silently, hits a tool-use approval gate (transcript-
    // derived), then a hook `Stop` event clears it even though the
    // transcript state hasn't been re-read yet.
    run_scenario(
        "replay-approval",
        &[
            Step {
                hook: None,
                transcript: Some(ClaudeState::Active),
                output: &["compiling..."],
                expect_waiting: false,
                expect_reason: None,
            },
            Step {
                hook: None,
                transcript: Some(ClaudeState::WaitingApproval),
                output: &[],
                expect_waiting: true,
                expect_reason: Some(WaitingReason::PermissionPrompt),
            },
            Step {
                hook: Some(WaitingReason::Stopped),
                transcript: None,
                output: &[],
                expect_waiting: false,
                expect_reason: None,
            },
        ],
    );
}

#[test]
fn output_only_prompt_detection_without_hooks_or_transcript() {
    // No hook payload and no transcript tail at all (e.g. monitoring not
    // yet attached) — the detector still catches an idle shell prompt from
    // raw captured output, then clears once real output resumes.
    run_scenario(
        "replay-output-only",
        &[
            Step {
                hook: None,
                transcript: None,
                output: &["Running tests", "3 passed"],
                expect_waiting: false,
                expect_reason: None,
            },
            Step {
                hook: None,
                transcript: None,
                output: &["Human: what should I do next?"],
                expect_waiting: true,
                expect_reason: Some(WaitingReason::IdlePrompt),
            },
            Step {
                hook: None,
                transcript: None,
                output: &["continuing with the fix"],
                expect_waiting: false,
                expect_reason: None,
            },
        ],
    );
}

#[test]
fn context_exhaustion_persists_until_transcript_moves_on() {
    run_scenario(
        "replay-context-exhausted",
        &[
            Step {
                hook: None,
                transcript: Some(ClaudeState::ContextExhausted),
                output: &[],
                expect_waiting: true,
                expect_reason: Some(WaitingReason::ContextExhausted),
            },
            Step {
                hook: None,
                transcript: Some(ClaudeState::ContextExhausted),
                output: &[],
                expect_waiting: true,
                expect_reason: Some(WaitingReason::ContextExhausted),
            },
            Step {
                hook: None,
                transcript: Some(ClaudeState::Completed),
                output: &[],
                expect_waiting: false,
                expect_reason: None,
            },
        ],
    );
}
