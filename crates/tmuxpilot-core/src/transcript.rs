use crate::domain::{ClaudeState, MonitoredSession, TranscriptContentBlock, TranscriptEntry, TranscriptUsage};

/// Default context window size used to turn a raw token count into a
/// percentage when a project does not override it.
pub const DEFAULT_CONTEXT_WINDOW_TOKENS: u64 = 200_000;

/// Parse one JSONL line into a transcript entry. Blank lines and lines that
/// fail to parse are swallowed (`None`) rather than propagated — a single
/// corrupt record must not stop the monitor from reading the rest of the
/// file.
pub fn parse_entry(line: &str) -> Option<TranscriptEntry> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Sum every token bucket reported by a usage block.
pub fn total_tokens(usage: &TranscriptUsage) -> u64 {
    usage.input_tokens
        + usage.cache_creation_input_tokens
        + usage.cache_read_input_tokens
        + usage.output_tokens
}

/// Convert a raw token count into a clamped, rounded percentage of the
/// context window.
pub fn context_percent(total_tokens: u64, window_tokens: u64) -> u8 {
    if window_tokens == 0 {
        return 100;
    }
    let pct = (total_tokens as f64 / window_tokens as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

/// Derive the agent's state from a single transcript entry's `stop_reason`
/// and content blocks. Returns `Unknown` when nothing recognizable is
/// present — callers must not let `Unknown` overwrite a previously known
/// state.
pub fn derive_claude_state(entry: &TranscriptEntry) -> ClaudeState {
    match entry.stop_reason.as_deref() {
        Some("max_tokens") => ClaudeState::ContextExhausted,
        Some("end_turn") | Some("stop_sequence") => ClaudeState::Completed,
        None if entry
            .content
            .iter()
            .any(|b| matches!(b, TranscriptContentBlock::ToolUse { .. })) =>
        {
            ClaudeState::WaitingApproval
        }
        None if !entry.content.is_empty() => ClaudeState::Active,
        _ => ClaudeState::Unknown,
    }
}

/// Fold one parsed entry into a session's running bookkeeping, honoring the
/// "unknown never overwrites" rule for `claude_state`.
pub fn apply_entry(
    session: &MonitoredSession,
    entry: &TranscriptEntry,
    window_tokens: u64,
) -> MonitoredSession {
    let mut next = session.clone();

    if let Some(usage) = entry.usage {
        next.total_tokens = total_tokens(&usage);
        next.context_percent = context_percent(next.total_tokens, window_tokens);
        next.last_usage = Some(usage);
    }

    let derived = derive_claude_state(entry);
    if derived != ClaudeState::Unknown {
        next.claude_state = derived;
    }

    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn session() -> MonitoredSession {
        MonitoredSession {
            session_id: "s1".into(),
            transcript_path: PathBuf::from("/tmp/t.jsonl"),
            file_position: 0,
            context_percent: 0,
            total_tokens: 0,
            claude_state: ClaudeState::Unknown,
            last_usage: None,
            threshold_notified: false,
        }
    }

    #[test]
    fn malformed_line_is_swallowed() {
        assert!(parse_entry("not json").is_none());
        assert!(parse_entry("").is_none());
        assert!(parse_entry("   ").is_none());
    }

    #[test]
    fn unrecognized_fields_still_parse_via_other_catchall() {
        let entry = parse_entry(r#"{"content":[{"type":"thinking","text":"hm"}]}"#).unwrap();
        assert_eq!(entry.content.len(), 1);
        assert!(matches!(entry.content[0], TranscriptContentBlock::Other));
    }

    #[test]
    fn context_percent_rounds_and_clamps() {
        assert_eq!(context_percent(100_000, 200_000), 50);
        assert_eq!(context_percent(199_999, 200_000), 100);
        assert_eq!(context_percent(250_000, 200_000), 100);
        assert_eq!(context_percent(0, 200_000), 0);
    }

    #[test]
    fn end_turn_is_completed() {
        let entry = TranscriptEntry {
            stop_reason: Some("end_turn".into()),
            ..Default::default()
        };
        assert_eq!(derive_claude_state(&entry), ClaudeState::Completed);
    }

    #[test]
    fn max_tokens_is_context_exhausted() {
        let entry = TranscriptEntry {
            stop_reason: Some("max_tokens".into()),
            ..Default::default()
        };
        assert_eq!(derive_claude_state(&entry), ClaudeState::ContextExhausted);
    }

    #[test]
    fn null_stop_reason_with_tool_use_block_is_waiting_approval() {
        let entry = TranscriptEntry {
            stop_reason: None,
            content: vec![TranscriptContentBlock::ToolUse {
                name: Some("Bash".into()),
            }],
            ..Default::default()
        };
        assert_eq!(derive_claude_state(&entry), ClaudeState::WaitingApproval);
    }

    #[test]
    fn null_stop_reason_with_text_only_is_active() {
        let entry = TranscriptEntry {
            stop_reason: None,
            content: vec![TranscriptContentBlock::Text {
                text: "thinking out loud".into(),
            }],
            ..Default::default()
        };
        assert_eq!(derive_claude_state(&entry), ClaudeState::Active);
    }

    #[test]
    fn null_stop_reason_with_no_content_is_unknown() {
        let entry = TranscriptEntry {
            stop_reason: None,
            content: vec![],
            ..Default::default()
        };
        assert_eq!(derive_claude_state(&entry), ClaudeState::Unknown);
    }

    #[test]
    fn unknown_state_does_not_overwrite_previous_known_state() {
        let mut prior = session();
        prior.claude_state = ClaudeState::WaitingApproval;
        let entry = TranscriptEntry::default();
        let next = apply_entry(&prior, &entry, DEFAULT_CONTEXT_WINDOW_TOKENS);
        assert_eq!(next.claude_state, ClaudeState::WaitingApproval);
    }

    #[test]
    fn apply_entry_updates_token_counts() {
        let prior = session();
        let entry = TranscriptEntry {
            usage: Some(TranscriptUsage {
                input_tokens: 1000,
                cache_creation_input_tokens: 0,
                cache_read_input_tokens: 0,
                output_tokens: 500,
            }),
            ..Default::default()
        };
        let next = apply_entry(&prior, &entry, DEFAULT_CONTEXT_WINDOW_TOKENS);
        assert_eq!(next.total_tokens, 1500);
        assert_eq!(next.last_usage.unwrap().input_tokens, 1000);
    }
}
