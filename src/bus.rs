use chrono::{DateTime, Local};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Service tag used for group-level messages on the bus.
pub const SYSTEM_TAG: &str = "warden";

/// One timestamped, service-tagged log line.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub timestamp: DateTime<Local>,
    pub service: String,
    pub line: String,
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] [{}] {}",
            self.timestamp.format("%H:%M:%S"),
            self.service,
            self.line
        )
    }
}

/// Multi-producer event stream carrying log lines from every supervisor
/// plus group-level messages.
///
/// The bus is created at group construction and handed out by cloning;
/// producers never block and no event is ever dropped. `drain` returns
/// everything queued so far in arrival order, which is the order events
/// reached the bus, not a cross-service ordering guarantee.
#[derive(Clone)]
pub struct LogBus {
    tx: UnboundedSender<LogEvent>,
    rx: Arc<Mutex<UnboundedReceiver<LogEvent>>>,
}

impl LogBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Queue one line tagged with the originating service name.
    pub fn emit(&self, service: &str, line: &str) {
        // The receiver half lives as long as any clone of the bus, so the
        // send can only fail once nothing can drain anyway.
        let _ = self.tx.send(LogEvent {
            timestamp: Local::now(),
            service: service.to_string(),
            line: line.to_string(),
        });
    }

    /// Non-blocking drain of all currently queued events, in arrival order.
    pub fn drain(&self) -> Vec<LogEvent> {
        let mut rx = self.rx.lock().unwrap();
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }
}

impl Default for LogBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_drain_in_order() {
        let bus = LogBus::new();

        bus.emit("web", "listening on 8080");
        bus.emit("db", "ready to accept connections");
        bus.emit("web", "first request served");

        let events = bus.drain();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].service, "web");
        assert_eq!(events[0].line, "listening on 8080");
        assert_eq!(events[1].service, "db");
        assert_eq!(events[2].line, "first request served");
    }

    #[tokio::test]
    async fn test_drain_empties_queue() {
        let bus = LogBus::new();

        bus.emit("web", "one");
        assert_eq!(bus.drain().len(), 1);
        assert!(bus.drain().is_empty());

        bus.emit("web", "two");
        assert_eq!(bus.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_cloned_producers_share_queue() {
        let bus = LogBus::new();
        let producer = bus.clone();

        producer.emit("worker", "from clone");
        bus.emit(SYSTEM_TAG, "from original");

        let events = bus.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].service, "worker");
        assert_eq!(events[1].service, SYSTEM_TAG);
    }

    #[tokio::test]
    async fn test_display_format() {
        let bus = LogBus::new();
        bus.emit("cache", "warmed");

        let events = bus.drain();
        let rendered = events[0].to_string();
        assert!(rendered.contains("[cache] warmed"));
    }
}
