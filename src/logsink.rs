//! Log fan-out. Every handler both emits through `tracing` and publishes
//! onto a broadcast channel, so an external consumer (a TUI, a file sink)
//! can subscribe without the proxy depending on a concrete consumer type.

use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
}

/// Capability a UI or archival consumer needs: the ability to subscribe to
/// log events. Kept separate from the lifecycle capability in `Listener` so
/// a consumer can depend on just this trait.
pub trait LogEmitter {
    fn subscribe(&self) -> broadcast::Receiver<LogEvent>;
}

/// Many-producer, single-or-multi-consumer fan-out. Delivery is best-effort:
/// a slow/absent subscriber sees `Lagged` on overflow rather than blocking
/// producers, which is `broadcast`'s native drop-oldest behavior.
#[derive(Clone)]
pub struct LogFanout {
    tx: broadcast::Sender<LogEvent>,
}

impl LogFanout {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warn => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
        }
        // No subscribers is a normal, non-error state.
        let _ = self.tx.send(LogEvent { level, message });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.publish(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.publish(LogLevel::Warn, message);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.publish(LogLevel::Debug, message);
    }
}

impl LogEmitter for LogFanout {
    fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.tx.subscribe()
    }
}
