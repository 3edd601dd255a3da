//! Logging for pvt
//!
//! Two audiences:
//! - Operators: `tracing` events, filtered with `RUST_LOG` (default `warn`,
//!   `--debug` raises to `debug`, `--json` for machine-readable output)
//! - The presentation layer: a bounded ring of status lines and the chat
//!   transcript, both readable as snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing_subscriber::{fmt as subscriber_fmt, EnvFilter};

pub const DEFAULT_STATUS_CAPACITY: usize = 200;
pub const DEFAULT_CHAT_CAPACITY: usize = 500;

/// Install the global subscriber. Safe to call more than once.
pub fn init(debug: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "warn" }));

    let builder = subscriber_fmt().with_env_filter(filter).with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.without_time().try_init()
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for StatusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusLevel::Info => write!(f, "INFO"),
            StatusLevel::Warning => write!(f, "WARNING"),
            StatusLevel::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub timestamp: DateTime<Utc>,
    pub level: StatusLevel,
    pub message: String,
}

impl fmt::Display for StatusEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}",
            self.timestamp.format("%H:%M:%S"),
            self.level,
            self.message
        )
    }
}

/// Bounded, oldest-evicted log of human-readable status lines
pub struct StatusLog {
    entries: Mutex<VecDeque<StatusEntry>>,
    /// Entries ever pushed, evicted ones included
    total: AtomicUsize,
    capacity: usize,
}

impl Default for StatusLog {
    fn default() -> Self {
        Self::new(DEFAULT_STATUS_CAPACITY)
    }
}

impl StatusLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            total: AtomicUsize::new(0),
            capacity: capacity.max(1),
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(StatusLevel::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.push(StatusLevel::Warning, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(StatusLevel::Error, message.into());
    }

    fn push(&self, level: StatusLevel, message: String) {
        match level {
            StatusLevel::Info => tracing::info!(status = %message),
            StatusLevel::Warning => tracing::warn!(status = %message),
            StatusLevel::Error => tracing::error!(status = %message),
        }
        let Ok(mut entries) = self.entries.lock() else { return };
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(StatusEntry {
            timestamp: Utc::now(),
            level,
            message,
        });
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    /// Oldest first
    pub fn snapshot(&self) -> Vec<StatusEntry> {
        self.entries
            .lock()
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Entries pushed after the first `seen`, plus the new total to pass next time.
    /// Entries already evicted are skipped.
    pub fn since(&self, seen: usize) -> (Vec<StatusEntry>, usize) {
        let Ok(entries) = self.entries.lock() else {
            return (Vec::new(), seen);
        };
        let total = self.total.load(Ordering::SeqCst);
        let fresh = total.saturating_sub(seen).min(entries.len());
        (entries.iter().skip(entries.len() - fresh).cloned().collect(), total)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Robot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub timestamp: DateTime<Utc>,
    pub speaker: Speaker,
    pub text: String,
}

/// User/robot turns in arrival order, oldest evicted past capacity
pub struct ChatLog {
    messages: Mutex<VecDeque<ChatMessage>>,
    total: AtomicUsize,
    capacity: usize,
}

impl Default for ChatLog {
    fn default() -> Self {
        Self::new(DEFAULT_CHAT_CAPACITY)
    }
}

impl ChatLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            total: AtomicUsize::new(0),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, speaker: Speaker, text: impl Into<String>) {
        let Ok(mut messages) = self.messages.lock() else { return };
        if messages.len() == self.capacity {
            messages.pop_front();
        }
        messages.push_back(ChatMessage {
            timestamp: Utc::now(),
            speaker,
            text: text.into(),
        });
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages
            .lock()
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Same paging contract as [`StatusLog::since`]
    pub fn since(&self, seen: usize) -> (Vec<ChatMessage>, usize) {
        let Ok(messages) = self.messages.lock() else {
            return (Vec::new(), seen);
        };
        let total = self.total.load(Ordering::SeqCst);
        let fresh = total.saturating_sub(seen).min(messages.len());
        (messages.iter().skip(messages.len() - fresh).cloned().collect(), total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_log_evicts_oldest() {
        let log = StatusLog::new(3);
        for i in 0..5 {
            log.info(format!("line {}", i));
        }
        let lines: Vec<String> = log.snapshot().into_iter().map(|e| e.message).collect();
        assert_eq!(lines, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_since_survives_eviction() {
        let log = StatusLog::new(2);
        log.info("a");
        let (first, seen) = log.since(0);
        assert_eq!(first.len(), 1);

        for m in ["b", "c", "d"] {
            log.info(m);
        }
        let (fresh, seen) = log.since(seen);
        let lines: Vec<String> = fresh.into_iter().map(|e| e.message).collect();
        assert_eq!(lines, vec!["c", "d"]);
        assert_eq!(seen, 4);
        assert!(log.since(seen).0.is_empty());
    }

    #[test]
    fn test_status_levels_and_display() {
        let log = StatusLog::default();
        log.warn("model slow");
        log.error("capture failed");
        let entries = log.snapshot();
        assert_eq!(entries[0].level, StatusLevel::Warning);
        assert!(entries[1].to_string().contains("ERROR capture failed"));
    }

    #[test]
    fn test_chat_log_order() {
        let chat = ChatLog::default();
        chat.push(Speaker::Robot, "Is the dialog expected?");
        chat.push(Speaker::User, "yes");
        let turns: Vec<Speaker> = chat.snapshot().iter().map(|m| m.speaker).collect();
        assert_eq!(turns, vec![Speaker::Robot, Speaker::User]);
    }

    #[test]
    fn test_chat_log_is_capped() {
        let chat = ChatLog::new(2);
        chat.push(Speaker::Robot, "first?");
        let (_, seen) = chat.since(0);

        chat.push(Speaker::User, "no");
        chat.push(Speaker::Robot, "second?");
        let texts: Vec<String> = chat.snapshot().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["no", "second?"]);

        let (fresh, seen) = chat.since(seen);
        assert_eq!(fresh.len(), 2);
        assert_eq!(seen, 3);
    }
}
