//! Status and progress events for observers (UI, CLI)

use serde::Serialize;
use tokio::sync::broadcast;

use super::SessionState;

/// Capacity of the per-session event channel. Slow subscribers lag.
pub const EVENT_CAPACITY: usize = 64;

/// Event emitted by a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The session changed state
    Status {
        /// New state
        state: SessionState,
        /// Human-readable description of what is happening
        phase: String,
    },
    /// Payload progress
    Progress {
        /// Bytes moved so far
        bytes_transferred: u64,
        /// Total payload size
        total_bytes: u64,
        /// File being moved
        file_name: String,
    },
}

/// Sending half of a session's event channel
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventSink {
    /// New channel with no subscribers
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        EventSink { tx }
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Never blocks; dropped when nobody listens.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let sink = EventSink::new();
        sink.emit(SessionEvent::Status {
            state: SessionState::Idle,
            phase: "created".into(),
        });

        let mut rx = sink.subscribe();
        let event = SessionEvent::Progress {
            bytes_transferred: 10,
            total_bytes: 20,
            file_name: "a.bin".into(),
        };
        sink.emit(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(SessionEvent::Status {
            state: SessionState::Transporting,
            phase: "trying relay".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["state"], "transporting");
    }
}
