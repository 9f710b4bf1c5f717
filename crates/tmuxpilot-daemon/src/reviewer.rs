use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use tmuxpilot_core::domain::{NotificationKind, TicketState};
use tmuxpilot_core::error::TicketError;

use crate::error::ReviewerError;
use crate::event_bus::{Event, EventBus};
use crate::notifications::NotificationService;
use crate::repository::Repository;
use crate::supervisor::Supervisor;
use crate::ticket_service::{TicketService, TicketServiceError};

/// What prompted a review run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewTrigger {
    StopHook,
    IdleTimeout,
    Manual,
}

impl ReviewTrigger {
    fn as_str(self) -> &'static str {
        match self {
            ReviewTrigger::StopHook => "stop_hook",
            ReviewTrigger::IdleTimeout => "idle_timeout",
            ReviewTrigger::Manual => "manual",
        }
    }
}

/// The reviewer's classification of a session's work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Complete,
    NotComplete,
    NeedsClarification,
}

impl ReviewDecision {
    fn as_str(self) -> &'static str {
        match self {
            ReviewDecision::Complete => "complete",
            ReviewDecision::NotComplete => "not_complete",
            ReviewDecision::NeedsClarification => "needs_clarification",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        let lower = raw.to_ascii_lowercase();
        if lower.contains("needs_clarification") {
            Some(ReviewDecision::NeedsClarification)
        } else if lower.contains("not_complete") {
            Some(ReviewDecision::NotComplete)
        } else if lower.contains("complete") {
            Some(ReviewDecision::Complete)
        } else {
            None
        }
    }
}

const MAX_DIFF_CHARS: usize = 50_000;
const DIFF_TRUNCATION_SUFFIX: &str = "\n...[diff truncated]";
const RING_BUFFER_TAIL_LINES: usize = 200;

/// Well-known relative paths checked, in order, for test output to include
/// in the reviewer prompt. The first one that exists under the project's
/// `repo_path` wins.
const TEST_OUTPUT_CANDIDATES: &[&str] = &[
    "test-results.txt",
    "target/nextest/default/test-results.json",
    ".test-output.log",
];

/// Launches the short-lived external reviewer CLI at well-chosen moments and
/// acts on its complete / not_complete / needs_clarification verdict.
pub struct ReviewerOrchestrator {
    repo: Arc<Repository>,
    supervisor: Arc<Supervisor>,
    ticket_service: Arc<TicketService>,
    notifications: Arc<NotificationService>,
    events: EventBus,
    claude_cli_path: String,
    model: Option<String>,
    timeout: Duration,
    in_progress: RwLock<HashSet<String>>,
}

impl ReviewerOrchestrator {
    pub fn new(
        repo: Arc<Repository>,
        supervisor: Arc<Supervisor>,
        ticket_service: Arc<TicketService>,
        notifications: Arc<NotificationService>,
        events: EventBus,
        claude_cli_path: String,
        model: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            repo,
            supervisor,
            ticket_service,
            notifications,
            events,
            claude_cli_path,
            model,
            timeout,
            in_progress: RwLock::new(HashSet::new()),
        }
    }

    /// Launch a review for `session_id`. At most one concurrent review per
    /// session; the caller's trigger and ticket's `in_progress` state are
    /// both validated before any process is spawned.
    pub async fn trigger_review(
        &self,
        session_id: &str,
        trigger: ReviewTrigger,
        cancel: CancellationToken,
    ) -> Result<ReviewDecision, ReviewerError> {
        {
            let mut guard = self.in_progress.write().await;
            if !guard.insert(session_id.to_string()) {
                return Err(ReviewerError::ReviewInProgress(session_id.to_string()));
            }
        }

        let result = self.run_review(session_id, trigger, cancel).await;
        self.in_progress.write().await.remove(session_id);
        result
    }

    pub async fn is_reviewing(&self, session_id: &str) -> bool {
        self.in_progress.read().await.contains(session_id)
    }

    async fn run_review(
        &self,
        session_id: &str,
        trigger: ReviewTrigger,
        cancel: CancellationToken,
    ) -> Result<ReviewDecision, ReviewerError> {
        let session = self
            .supervisor
            .get_session(session_id)
            .await
            .ok_or_else(|| ReviewerError::NotInReview(session_id.to_string()))?;
        let ticket_id = session
            .ticket_id
            .ok_or_else(|| ReviewerError::NotInReview(session_id.to_string()))?;
        let ticket = self
            .repo
            .load_ticket(&ticket_id)?
            .ok_or_else(|| ReviewerError::NotInReview(ticket_id.clone()))?;
        if ticket.state != TicketState::InProgress {
            return Err(ReviewerError::NotInReview(ticket_id));
        }

        let project = self.repo.load_project(&session.project_id)?;
        let repo_path = project.as_ref().map(|p| p.repo_path.clone());

        self.events.publish(Event::ReviewStarted {
            session_id: session_id.to_string(),
            ticket_id: ticket_id.clone(),
        });
        tracing::info!(session_id, ticket_id, trigger = trigger.as_str(), "reviewer: starting review");

        let prompt = self.assemble_prompt(session_id, &ticket, repo_path.as_deref()).await;

        match self.run_reviewer_process(&prompt, cancel).await {
            Ok((decision, reasoning)) => {
                self.handle_decision(session_id, &ticket_id, decision, &reasoning)?;
                self.events.publish(Event::ReviewCompleted {
                    session_id: session_id.to_string(),
                    ticket_id: ticket_id.clone(),
                    decision: decision.as_str().to_string(),
                    reasoning,
                });
                Ok(decision)
            }
            Err(e) => {
                self.events.publish(Event::ReviewFailed {
                    session_id: session_id.to_string(),
                    ticket_id,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn assemble_prompt(
        &self,
        session_id: &str,
        ticket: &tmuxpilot_core::domain::Ticket,
        repo_path: Option<&str>,
    ) -> String {
        let ticket_contents =
            tokio::fs::read_to_string(&ticket.file_path).await.unwrap_or_else(|_| "[Ticket file not found]".into());

        let diff = self.collect_diff(repo_path).await;
        let test_output = self.collect_test_output(repo_path).await;
        let recent_output = self
            .supervisor
            .get_session_output(session_id, RING_BUFFER_TAIL_LINES)
            .await
            .unwrap_or_default()
            .join("\n");

        format!(
            "# Ticket\n{ticket_contents}\n\n# Diff\n{diff}\n\n# Test output\n{test_output}\n\n# Recent session output\n{recent_output}\n"
        )
    }

    async fn collect_diff(&self, repo_path: Option<&str>) -> String {
        let Some(repo_path) = repo_path else {
            return "No changes detected".to_string();
        };

        let diff = self.run_git_diff(repo_path, &["diff", "HEAD"]).await;
        let diff = match diff {
            Some(d) if !d.trim().is_empty() => d,
            _ => self
                .run_git_diff(repo_path, &["diff", "HEAD~5..HEAD"])
                .await
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| "No changes detected".to_string()),
        };

        if diff.len() > MAX_DIFF_CHARS {
            let mut truncated = diff[..MAX_DIFF_CHARS].to_string();
            truncated.push_str(DIFF_TRUNCATION_SUFFIX);
            truncated
        } else {
            diff
        }
    }

    async fn run_git_diff(&self, repo_path: &str, args: &[&str]) -> Option<String> {
        let mut cmd_args = vec!["-C", repo_path];
        cmd_args.extend_from_slice(args);
        let output = Command::new("git").args(&cmd_args).output().await.ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn collect_test_output(&self, repo_path: Option<&str>) -> String {
        let Some(repo_path) = repo_path else {
            return "[No test output found]".to_string();
        };
        for candidate in TEST_OUTPUT_CANDIDATES {
            let path = std::path::Path::new(repo_path).join(candidate);
            if let Ok(contents) = tokio::fs::read_to_string(&path).await {
                return contents;
            }
        }
        "[No test output found]".to_string()
    }

    async fn run_reviewer_process(
        &self,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<(ReviewDecision, String), ReviewerError> {
        let mut args = vec!["--print".to_string(), "--dangerously-skip-permissions".to_string()];
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        let mut child = Command::new(&self.claude_cli_path)
            .args(&args)
            .env("CI", "true")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ReviewerError::ReviewerBinaryMissing(self.claude_cli_path.clone())
                } else {
                    ReviewerError::Io(e)
                }
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await.map_err(ReviewerError::Io)?;
            stdin.shutdown().await.map_err(ReviewerError::Io)?;
        }

        let stdout_task = child.stdout.take().map(|mut stdout| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = tokio::io::AsyncReadExt::read_to_end(&mut stdout, &mut buf).await;
                buf
            })
        });

        enum Outcome {
            Done(std::process::ExitStatus),
            TimedOut,
            Cancelled,
        }

        let timeout_fut = tokio::time::sleep(self.timeout);
        tokio::pin!(timeout_fut);

        let outcome = tokio::select! {
            res = child.wait() => match res {
                Ok(status) => Outcome::Done(status),
                Err(e) => return Err(ReviewerError::Io(e)),
            },
            _ = &mut timeout_fut => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        match outcome {
            Outcome::Done(_status) => {
                let stdout_bytes = match stdout_task {
                    Some(task) => task.await.unwrap_or_default(),
                    None => Vec::new(),
                };
                let text = String::from_utf8_lossy(&stdout_bytes).into_owned();
                let decision = ReviewDecision::parse(&text)
                    .ok_or_else(|| ReviewerError::ReviewExecutionError("reviewer returned no recognizable decision".into()))?;
                Ok((decision, text))
            }
            Outcome::TimedOut => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(ReviewerError::ReviewTimeout(self.timeout))
            }
            Outcome::Cancelled => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(ReviewerError::ReviewCancelled)
            }
        }
    }

    fn handle_decision(
        &self,
        session_id: &str,
        ticket_id: &str,
        decision: ReviewDecision,
        reasoning: &str,
    ) -> Result<(), ReviewerError> {
        match decision {
            ReviewDecision::Complete => {
                match self.ticket_service.move_to_review(ticket_id) {
                    Ok(_) => {}
                    Err(TicketServiceError::Ticket(TicketError::InvalidTransition { .. })) => {
                        tracing::debug!(ticket_id, "reviewer: move_to_review no-op, already past in_progress");
                    }
                    Err(TicketServiceError::Repository(e)) => return Err(ReviewerError::Repository(e)),
                    Err(e) => return Err(ReviewerError::ReviewExecutionError(e.to_string())),
                }
                self.notifications.raise(
                    NotificationKind::ReviewReady,
                    "review ready",
                    Some(session_id.to_string()),
                    Some(ticket_id.to_string()),
                )?;
            }
            ReviewDecision::NotComplete => {
                tracing::debug!(ticket_id, reasoning, "reviewer: not complete, no action taken");
            }
            ReviewDecision::NeedsClarification => {
                self.notifications.raise(
                    NotificationKind::WaitingInput,
                    "reviewer needs clarification",
                    Some(session_id.to_string()),
                    Some(ticket_id.to_string()),
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_parses_each_category() {
        assert_eq!(ReviewDecision::parse("DECISION: complete\n"), Some(ReviewDecision::Complete));
        assert_eq!(ReviewDecision::parse("decision=not_complete"), Some(ReviewDecision::NotComplete));
        assert_eq!(
            ReviewDecision::parse("needs_clarification: missing tests"),
            Some(ReviewDecision::NeedsClarification)
        );
        assert_eq!(ReviewDecision::parse("garbage output"), None);
    }

    #[test]
    fn decision_parse_prefers_more_specific_match_over_substring() {
        // "not_complete" contains "complete" but must not be misread as Complete.
        assert_eq!(ReviewDecision::parse("not_complete"), Some(ReviewDecision::NotComplete));
    }

    #[tokio::test]
    async fn trigger_review_on_unknown_session_is_not_in_review() {
        let repo = Arc::new(Repository::open_in_memory().unwrap());
        let events = EventBus::default();
        let mux = Arc::new(tmuxpilot_mux::TmuxAdapter::new());
        let supervisor = Arc::new(Supervisor::new(mux, repo.clone(), events.clone(), Duration::from_secs(5)));
        let ticket_service = Arc::new(TicketService::new(repo.clone(), events.clone()));
        let notifications = Arc::new(NotificationService::new(repo.clone(), events.clone()));
        let orchestrator = ReviewerOrchestrator::new(
            repo,
            supervisor,
            ticket_service,
            notifications,
            events,
            "claude".into(),
            None,
            Duration::from_secs(30),
        );

        let err = orchestrator
            .trigger_review("ghost", ReviewTrigger::Manual, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReviewerError::NotInReview(_)));
        assert!(!orchestrator.is_reviewing("ghost").await);
    }
}
