//! Process-wide log bus.
//!
//! The original UI consumed a stream of human-readable status lines
//! ("MESSAGE_DETECTED", "MAIL_SENT", ...). Here that is an explicit
//! broadcast channel any number of subscribers can tap; publishing never
//! blocks and never fails, even with zero subscribers.

use tokio::sync::broadcast;

/// Wall-clock stamp used in debug-trace values ("HH:MM:SS").
pub fn stamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

/// Broadcast bus of human-readable pipeline events.
#[derive(Debug, Clone)]
pub struct LogBus {
    tx: broadcast::Sender<String>,
}

impl LogBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish one event line. Dropped silently if nobody is listening.
    pub fn publish(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::debug!(event = %line, "log bus");
        let _ = self.tx.send(line);
    }

    /// Subscribe to the event feed from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Default for LogBus {
    fn default() -> Self {
        Self::new(256)
    }
}
