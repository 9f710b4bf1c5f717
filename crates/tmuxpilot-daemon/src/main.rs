use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use tmuxpilot_core::domain::{SessionKind, SessionStatus};
use tmuxpilot_mux::{TmuxAdapter, TmuxExecutor};

use tmuxpilot_daemon::cli::{Cli, Commands};
use tmuxpilot_daemon::context_monitor::{usage_threshold, ContextMonitor};
use tmuxpilot_daemon::event_bus::{Event, EventBus};
use tmuxpilot_daemon::handoff::HandoffController;
use tmuxpilot_daemon::hub::Hub;
use tmuxpilot_daemon::notifications::NotificationService;
use tmuxpilot_daemon::pty_manager::PtyManager;
use tmuxpilot_daemon::recorder::Recorder;
use tmuxpilot_daemon::repository::Repository;
use tmuxpilot_daemon::reviewer::{ReviewerOrchestrator, ReviewTrigger};
use tmuxpilot_daemon::status::format_status;
use tmuxpilot_daemon::supervisor::Supervisor;
use tmuxpilot_daemon::ticket_service::TicketService;
use tmuxpilot_daemon::waiting_detector::WaitingDetector;
use tmuxpilot_daemon::ws_server::WsServer;

/// Default cadence at which the supervisor re-captures pane output into its
/// ring buffers.
const DEFAULT_CAPTURE_INTERVAL: Duration = Duration::from_millis(500);
/// Default cadence at which the waiting detector re-evaluates every tracked
/// session between hook events.
const DEFAULT_WAITING_POLL_INTERVAL: Duration = Duration::from_secs(3);
/// Default cadence at which the context monitor's resilient poll fallback
/// re-reads every registered transcript.
const DEFAULT_CONTEXT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_REVIEW_TIMEOUT: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Status) => run_status(&cli.db_path).await,
        None | Some(Commands::Serve { .. }) => {
            let record = match cli.command {
                Some(Commands::Serve { record }) => record,
                _ => None,
            };
            run_daemon(cli, record).await
        }
    }
}

async fn run_status(db_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let repo = Repository::open(std::path::Path::new(db_path))?;
    let sessions = repo.load_all_sessions()?;
    let tickets = repo.load_all_tickets()?;
    println!("{}", format_status(&sessions, &tickets));
    Ok(())
}

async fn run_daemon(cli: Cli, record: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        bind_addr = %cli.bind_addr,
        db_path = %cli.db_path,
        tmux_path = %cli.tmux_path,
        handoff_threshold_percent = cli.handoff_threshold_percent,
        "starting tmuxpilot daemon"
    );

    // ---------------------------------------------------------------
    // 1. Multiplexer adapter
    // ---------------------------------------------------------------
    let mux = Arc::new(TmuxAdapter::with_executor(TmuxExecutor::with_bin(cli.tmux_path.clone())));

    // ---------------------------------------------------------------
    // 2. Event bus
    // ---------------------------------------------------------------
    let events = EventBus::default();

    // ---------------------------------------------------------------
    // 3. Persistence
    // ---------------------------------------------------------------
    let repo = Arc::new(Repository::open(std::path::Path::new(&cli.db_path))?);

    // ---------------------------------------------------------------
    // 4. Session supervisor
    // ---------------------------------------------------------------
    let supervisor = Arc::new(Supervisor::new(mux.clone(), repo.clone(), events.clone(), DEFAULT_CAPTURE_INTERVAL));
    supervisor.restore().await?;

    // ---------------------------------------------------------------
    // 5. Context monitor
    // ---------------------------------------------------------------
    let notifications = Arc::new(NotificationService::new(repo.clone(), events.clone()));
    let context_monitor = Arc::new(ContextMonitor::new(
        events.clone(),
        notifications.clone(),
        supervisor.clone(),
        cli.handoff_threshold_percent,
        DEFAULT_CONTEXT_POLL_INTERVAL,
    ));

    // ---------------------------------------------------------------
    // 6. Waiting detector
    // ---------------------------------------------------------------
    let waiting_detector = Arc::new(WaitingDetector::new(
        supervisor.clone(),
        context_monitor.clone(),
        notifications.clone(),
        events.clone(),
    ));

    // ---------------------------------------------------------------
    // 7. Ticket state machine
    // ---------------------------------------------------------------
    let ticket_service =
        Arc::new(TicketService::new(repo.clone(), events.clone()).with_supervisor(supervisor.clone()));

    // ---------------------------------------------------------------
    // 8. Reviewer orchestrator
    // ---------------------------------------------------------------
    let reviewer = Arc::new(ReviewerOrchestrator::new(
        repo.clone(),
        supervisor.clone(),
        ticket_service.clone(),
        notifications.clone(),
        events.clone(),
        cli.claude_cli_path.clone(),
        None,
        DEFAULT_REVIEW_TIMEOUT,
    ));

    // ---------------------------------------------------------------
    // 9. Auto-handoff controller
    // ---------------------------------------------------------------
    let handoff = Arc::new(HandoffController::new(
        repo.clone(),
        supervisor.clone(),
        notifications.clone(),
        events.clone(),
        cli.claude_cli_path.clone(),
    ));

    // ---------------------------------------------------------------
    // 10. Realtime fan-out hub
    // ---------------------------------------------------------------
    let pty_manager = Arc::new(PtyManager::new(supervisor.clone(), mux.clone()));
    let hub = Arc::new(Hub::new(supervisor.clone(), pty_manager, mux.clone(), events.clone(), cli.api_key.clone()));

    // ---------------------------------------------------------------
    // 11. Optional JSONL recorder
    // ---------------------------------------------------------------
    let mut recorder = match record {
        Some(ref path) => {
            let rx = events.subscribe();
            let r = Recorder::new(std::path::Path::new(path), rx)?;
            tracing::info!(path = %path, "event recorder enabled");
            Some(r)
        }
        None => None,
    };

    let cancel = CancellationToken::new();
    let addr: SocketAddr = cli.bind_addr.parse()?;
    let ws_server = WsServer::new(addr, hub.clone(), cancel.clone());

    let coordinator = spawn_auto_trigger_coordinator(
        events.clone(),
        supervisor.clone(),
        reviewer.clone(),
        handoff.clone(),
        cli.handoff_threshold_percent,
        cancel.clone(),
    );

    tracing::info!("all components constructed, starting event loops");

    tokio::select! {
        _ = supervisor.run(cancel.clone()) => {
            tracing::warn!("supervisor loop exited unexpectedly");
        }
        _ = context_monitor.run(cancel.clone()) => {
            tracing::warn!("context monitor loop exited unexpectedly");
        }
        _ = waiting_detector.run(cancel.clone(), DEFAULT_WAITING_POLL_INTERVAL) => {
            tracing::warn!("waiting detector loop exited unexpectedly");
        }
        _ = hub.run(cancel.clone()) => {
            tracing::warn!("hub fan-out loop exited unexpectedly");
        }
        result = ws_server.run() => {
            match result {
                Ok(()) => tracing::warn!("websocket server exited unexpectedly"),
                Err(e) => tracing::warn!(error = %e, "websocket server error"),
            }
        }
        _ = async {
            if let Some(r) = recorder.as_mut() {
                r.run().await;
            } else {
                std::future::pending::<()>().await;
            }
        } => {
            tracing::warn!("recorder loop exited unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
        }
    }

    cancel.cancel();
    let _ = coordinator.await;

    Ok(())
}

/// Subscribes to the event bus and drives the two automatic triggers the
/// rest of the system only detects, never acts on: a session going idle or
/// hitting its stop hook (the review trigger) and a session's context
/// window crossing the configured handoff threshold (the handoff trigger).
/// Each trigger is spawned off the event loop so a slow review or handoff
/// never delays the next event's dispatch.
fn spawn_auto_trigger_coordinator(
    events: EventBus,
    supervisor: Arc<Supervisor>,
    reviewer: Arc<ReviewerOrchestrator>,
    handoff: Arc<HandoffController>,
    handoff_threshold_percent: u8,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = events.subscribe();
        loop {
            let event = tokio::select! {
                event = rx.recv() => event,
                _ = cancel.cancelled() => break,
            };

            let event = match event {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "auto-trigger coordinator lagged behind the event bus");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };

            match event {
                Event::WaitingStateChanged { session_id, is_waiting: true, reason } => {
                    let trigger = match reason.as_str() {
                        "Stopped" => Some(ReviewTrigger::StopHook),
                        "IdlePrompt" => Some(ReviewTrigger::IdleTimeout),
                        _ => None,
                    };
                    let Some(trigger) = trigger else { continue };

                    let Some(session) = supervisor.get_session(&session_id).await else { continue };
                    if session.kind != SessionKind::Ticket {
                        continue;
                    }
                    if reviewer.is_reviewing(&session_id).await {
                        continue;
                    }

                    let reviewer = reviewer.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = reviewer.trigger_review(&session_id, trigger, cancel).await {
                            tracing::debug!(session_id, error = %e, "auto-trigger: review not started");
                        }
                    });
                }
                Event::ContextPercentUpdated { session_id, context_percent } => {
                    if context_percent < usage_threshold(handoff_threshold_percent) {
                        continue;
                    }
                    let Some(session) = supervisor.get_session(&session_id).await else { continue };
                    if session.kind != SessionKind::Ticket || session.status != SessionStatus::Running {
                        continue;
                    }
                    if handoff.is_handing_off(&session_id).await {
                        continue;
                    }

                    let handoff = handoff.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handoff.trigger_handoff(&session_id, cancel).await {
                            tracing::debug!(session_id, error = %e, "auto-trigger: handoff not started");
                        }
                    });
                }
                _ => {}
            }
        }
    })
}
