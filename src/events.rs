//! Typed session events delivered to the embedding application

use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Severity of a status report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKind {
    /// A setup or transfer step is under way or finished
    Progress,
    /// Informational detail (negotiated features, fingerprints)
    Info,
    /// Something suspicious that did not stop the session
    Warning,
    /// A step failed
    Error,
}

/// Human-readable progress report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub kind: StatusKind,
    pub message: String,
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

/// Everything a communicator reports to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Status(StatusEvent),
    MessageReceived(String),
    ConnectionLost,
}

/// Sending side of the event stream.
///
/// Every status report is mirrored to `tracing`. Reports are dropped
/// silently once the receiver is gone.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiver to hand to the application
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn status(&self, kind: StatusKind, message: impl Into<String>) {
        let message = message.into();
        match kind {
            StatusKind::Progress => debug!("{message}"),
            StatusKind::Info => info!("{message}"),
            StatusKind::Warning => warn!("{message}"),
            StatusKind::Error => error!("{message}"),
        }
        let _ = self
            .tx
            .send(SessionEvent::Status(StatusEvent { kind, message }));
    }

    pub fn progress(&self, message: impl Into<String>) {
        self.status(StatusKind::Progress, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.status(StatusKind::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.status(StatusKind::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.status(StatusKind::Error, message);
    }

    pub(crate) fn message_received(&self, text: String) {
        let _ = self.tx.send(SessionEvent::MessageReceived(text));
    }

    pub(crate) fn connection_lost(&self) {
        let _ = self.tx.send(SessionEvent::ConnectionLost);
    }
}
