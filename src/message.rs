//! Chat transcript entries

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// One line of a chat transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    pub text: String,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

impl ChatMessage {
    /// Message stamped with the current time
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        Self::at(sender, text, timestamp_ms)
    }

    pub fn at(sender: impl Into<String>, text: impl Into<String>, timestamp_ms: u64) -> Self {
        Self {
            sender: sender.into(),
            text: text.into(),
            timestamp_ms,
        }
    }
}

impl fmt::Display for ChatMessage {
    /// `[HH:MM:SS] sender: text`, time of day in UTC
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seconds = (self.timestamp_ms / 1000) % 86_400;
        write!(
            f,
            "[{:02}:{:02}:{:02}] {}: {}",
            seconds / 3600,
            (seconds % 3600) / 60,
            seconds % 60,
            self.sender,
            self.text
        )
    }
}
