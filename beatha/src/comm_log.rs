//! Bounded trace of the last serial conversation.
//!
//! The log keeps the newest [`COMM_LOG_CAPACITY`] entries and evicts the
//! oldest first. It has its own lock because the transport appends to it on
//! every line, far more often than any other session field is written.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local};

/// Maximum number of retained entries.
pub const COMM_LOG_CAPACITY: usize = 100;

/// Direction of a logged line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Direction {
    /// Bytes sent to the device.
    Tx,
    /// Bytes received from the device.
    Rx,
    /// Local annotation.
    Info,
    /// Local failure.
    Error,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tx => write!(f, "tx"),
            Self::Rx => write!(f, "rx"),
            Self::Info => write!(f, "info"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One logged line.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CommLogEntry {
    /// When the line was logged.
    pub timestamp: DateTime<Local>,
    /// Direction.
    pub direction: Direction,
    /// Line text, without line terminator.
    pub text: String,
}

impl fmt::Display for CommLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:>5}] {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.direction,
            self.text
        )
    }
}

/// Thread-safe bounded communication log.
#[derive(Debug, Default)]
pub struct CommLog {
    entries: Mutex<VecDeque<CommLogEntry>>,
}

impl CommLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<CommLogEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an entry, evicting the oldest one when full.
    pub fn push(&self, direction: Direction, text: impl Into<String>) {
        let entry = CommLogEntry {
            timestamp: Local::now(),
            direction,
            text: text.into(),
        };
        let mut entries = self.lock();
        while entries.len() >= COMM_LOG_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Log a transmitted line.
    pub fn tx(&self, text: impl Into<String>) {
        self.push(Direction::Tx, text);
    }

    /// Log a received line.
    pub fn rx(&self, text: impl Into<String>) {
        self.push(Direction::Rx, text);
    }

    /// Log an annotation.
    pub fn info(&self, text: impl Into<String>) {
        self.push(Direction::Info, text);
    }

    /// Log a failure.
    pub fn error(&self, text: impl Into<String>) {
        self.push(Direction::Error, text);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Copy out the current entries, oldest first.
    pub fn snapshot(&self) -> Vec<CommLogEntry> {
        self.lock().iter().cloned().collect()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
