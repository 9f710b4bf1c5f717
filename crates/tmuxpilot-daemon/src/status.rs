use tmuxpilot_core::domain::{Session, SessionStatus, Ticket};

fn state_indicator(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Running => "●",
        SessionStatus::Paused => "◉",
        SessionStatus::Completed => "○",
        SessionStatus::Error => "✗",
    }
}

fn format_ticket_title<'a>(ticket_id: Option<&str>, tickets: &'a [Ticket]) -> &'a str {
    match ticket_id {
        Some(id) => tickets
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.title.as_str())
            .unwrap_or("—"),
        None => "—",
    }
}

fn format_summary(sessions: &[Session]) -> String {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for (label, status) in [
        ("running", SessionStatus::Running),
        ("paused", SessionStatus::Paused),
        ("completed", SessionStatus::Completed),
        ("error", SessionStatus::Error),
    ] {
        let count = sessions.iter().filter(|s| s.status == status).count();
        if count > 0 {
            counts.push((label, count));
        }
    }
    if counts.is_empty() {
        return "no sessions".to_string();
    }
    counts
        .iter()
        .map(|(name, count)| format!("{count} {name}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Render a one-shot textual snapshot of every session, cross-referenced
/// against its ticket title when it has one. Used by the `status`
/// subcommand (a supplemented feature) — there is no daemon socket to
/// query here, so the caller is expected to have constructed these lists
/// directly from the repository.
///
/// Example output:
/// ```text
/// tmuxpilot status
/// ─────────────────────────────────────────────────────────────
/// ● s1  ticket   Running   72%  Fix flaky session restore test
/// ○ s2  adhoc    Completed 10%  —
///
/// Summary: 1 running, 1 completed
/// ```
pub fn format_status(sessions: &[Session], tickets: &[Ticket]) -> String {
    let mut out = String::new();
    out.push_str("tmuxpilot status\n");
    out.push_str("─────────────────────────────────────────────────────────────\n");

    if sessions.is_empty() {
        out.push_str("  No sessions.\n");
        return out;
    }

    for session in sessions {
        let indicator = state_indicator(session.status);
        let kind = match session.kind {
            tmuxpilot_core::domain::SessionKind::Adhoc => "adhoc",
            tmuxpilot_core::domain::SessionKind::Ticket => "ticket",
        };
        let title = format_ticket_title(session.ticket_id.as_deref(), tickets);
        out.push_str(&format!(
            "{} {:<8} {:<8} {:<10} {:>3}%  {}\n",
            indicator,
            session.id,
            kind,
            format!("{:?}", session.status),
            session.context_percent,
            title,
        ));
    }

    out.push('\n');
    out.push_str(&format!("Summary: {}\n", format_summary(sessions)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tmuxpilot_core::domain::{SessionKind, TicketState};

    fn session(id: &str, kind: SessionKind, status: SessionStatus, ticket_id: Option<&str>) -> Session {
        Session {
            id: id.into(),
            project_id: "p1".into(),
            ticket_id: ticket_id.map(|s| s.to_string()),
            parent_session_id: None,
            kind,
            status,
            pane_id: Some("%1".into()),
            context_percent: 42,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    fn ticket(id: &str, title: &str) -> Ticket {
        Ticket {
            id: id.into(),
            external_id: format!("EXT-{id}"),
            title: title.into(),
            state: TicketState::InProgress,
            file_path: format!("tickets/{id}.md"),
            is_adhoc: false,
            started_at: Some(Utc::now()),
            completed_at: None,
            rejection_feedback: None,
        }
    }

    #[test]
    fn empty_sessions_prints_placeholder() {
        let out = format_status(&[], &[]);
        assert!(out.contains("No sessions."));
    }

    #[test]
    fn ticket_title_is_resolved_by_id() {
        let sessions = vec![session("s1", SessionKind::Ticket, SessionStatus::Running, Some("t1"))];
        let tickets = vec![ticket("t1", "Fix flaky test")];
        let out = format_status(&sessions, &tickets);
        assert!(out.contains("Fix flaky test"));
    }

    #[test]
    fn adhoc_session_shows_dash_for_title() {
        let sessions = vec![session("s1", SessionKind::Adhoc, SessionStatus::Completed, None)];
        let out = format_status(&sessions, &[]);
        assert!(out.contains("—"));
    }

    #[test]
    fn summary_counts_by_status() {
        let sessions = vec![
            session("s1", SessionKind::Adhoc, SessionStatus::Running, None),
            session("s2", SessionKind::Adhoc, SessionStatus::Running, None),
            session("s3", SessionKind::Adhoc, SessionStatus::Error, None),
        ];
        let out = format_status(&sessions, &[]);
        assert!(out.contains("2 running"));
        assert!(out.contains("1 error"));
    }
}
