//! Event log - append-only JSONL record of bus traffic
//!
//! A dedicated subscriber task writes one JSON line per event to
//! `.apex/events.jsonl` for postmortems. Lag is tolerated: missed events
//! are counted and logged, never blocking the emitter.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::bus::EventBus;
use super::types::Event;

/// File name inside the state directory
pub const EVENT_LOG_FILE: &str = "events.jsonl";

/// One line of the event log
#[derive(Debug, Serialize)]
struct EventLogLine<'a> {
    ts: chrono::DateTime<chrono::Utc>,
    event: &'static str,
    #[serde(flatten)]
    payload: &'a Event,
}

/// Spawn the logger task; it runs until the bus is dropped or the
/// returned handle is aborted.
pub fn spawn_event_logger(bus: &Arc<EventBus>, state_dir: PathBuf) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    let path = state_dir.join(EVENT_LOG_FILE);

    tokio::spawn(async move {
        let mut dropped: u64 = 0;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = append_line(&path, &event) {
                        debug!(error = %e, "failed to append event log line");
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    dropped += missed;
                    warn!(missed, total_dropped = dropped, "event logger lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("event logger stopped");
    })
}

fn append_line(path: &PathBuf, event: &Event) -> std::io::Result<()> {
    let line = EventLogLine {
        ts: event.timestamp(),
        event: event.event_type(),
        payload: event,
    };
    let encoded = serde_json::to_string(&line)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{}", encoded)
}
