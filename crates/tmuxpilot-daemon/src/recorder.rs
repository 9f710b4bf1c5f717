use std::io::Write;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::event_bus::Event;

/// A single recorded line in the JSONL event log (a supplemented
/// feature). One line per bus event, timestamped at write time rather than
/// relying on each event carrying its own clock.
#[derive(Debug, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: Event,
}

/// Optional JSONL recorder, enabled with `--record <path>`. Subscribes to
/// the event bus and appends every event it sees; independent of every
/// other subscriber, so a slow or absent recorder never affects the hub.
pub struct Recorder {
    writer: std::fs::File,
    rx: broadcast::Receiver<Event>,
    cancel: CancellationToken,
}

impl Recorder {
    pub fn new(path: &Path, rx: broadcast::Receiver<Event>) -> std::io::Result<Self> {
        Self::with_cancel(path, rx, CancellationToken::new())
    }

    pub fn with_cancel(
        path: &Path,
        rx: broadcast::Receiver<Event>,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let writer = std::fs::File::create(path)?;
        Ok(Self { writer, rx, cancel })
    }

    /// Run until cancelled or the bus closes. Every write is flushed
    /// immediately so a killed process loses at most the in-flight event.
    pub async fn run(&mut self) {
        loop {
            tokio::select! {
                result = self.rx.recv() => {
                    match result {
                        Ok(event) => self.write_event(event),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "recorder lagged, dropped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::info!("recorder: event bus closed, stopping");
                            break;
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("recorder: cancellation requested, shutting down");
                    break;
                }
            }
        }
    }

    fn write_event(&mut self, event: Event) {
        let record = RecordedEvent {
            ts: Utc::now().to_rfc3339(),
            event,
        };
        match serde_json::to_string(&record) {
            Ok(line) => {
                if let Err(e) = writeln!(self.writer, "{line}") {
                    tracing::error!("recorder write failed: {e}");
                }
                if let Err(e) = self.writer.flush() {
                    tracing::error!("recorder flush failed: {e}");
                }
            }
            Err(e) => tracing::error!("recorder serialization failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;
    use std::io::{BufRead, BufReader};

    #[tokio::test]
    async fn recorded_lines_round_trip_and_stay_single_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let bus = EventBus::default();
        let rx = bus.subscribe();
        let cancel = CancellationToken::new();
        let mut recorder = Recorder::with_cancel(&path, rx, cancel.clone()).unwrap();

        bus.publish(Event::SessionEnded { session_id: "s1".into() });
        let task = tokio::spawn(async move { recorder.run().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();
        task.await.unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let lines: Vec<String> = BufReader::new(file).lines().map(|l| l.unwrap()).collect();
        assert_eq!(lines.len(), 1);
        assert!(!lines[0].contains('\n'));
        let parsed: RecordedEvent = serde_json::from_str(&lines[0]).unwrap();
        assert!(matches!(parsed.event, Event::SessionEnded { session_id } if session_id == "s1"));
    }
}
