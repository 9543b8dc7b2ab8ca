//! Bounded in-memory log for the polling UI.
//!
//! Diagnostic logging goes through `tracing`; this ring holds the
//! operator-facing lines the web UI shows next to the plate view. Fixed
//! capacity, oldest evicted, readable at any time without touching the
//! motion lock.

use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub const LOG_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub message: String,
}

impl LogEntry {
    /// The line as shown to the operator.
    pub fn render(&self) -> String {
        format!("[{}] {}", self.timestamp.format("%H:%M:%S"), self.message)
    }
}

/// A thread-safe, fixed-capacity log buffer.
#[derive(Clone)]
pub struct LogRing(Arc<Mutex<VecDeque<LogEntry>>>);

impl Default for LogRing {
    fn default() -> Self {
        Self::new()
    }
}

impl LogRing {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(VecDeque::with_capacity(LOG_CAPACITY))))
    }

    pub fn push(&self, message: impl Into<String>) {
        let mut buffer = self.0.lock().unwrap_or_else(|p| p.into_inner());
        if buffer.len() >= LOG_CAPACITY {
            buffer.pop_front();
        }
        buffer.push_back(LogEntry {
            timestamp: Local::now(),
            message: message.into(),
        });
    }

    /// The most recent `n` lines, oldest first.
    pub fn last(&self, n: usize) -> Vec<String> {
        let buffer = self.0.lock().unwrap_or_else(|p| p.into_inner());
        let skip = buffer.len().saturating_sub(n);
        buffer.iter().skip(skip).map(LogEntry::render).collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}
