use std::{collections::VecDeque, fmt};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

pub const DEFAULT_LOG_CAPACITY: usize = 200;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// One line of captured process output, stamped when it was read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

impl LogLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self::at(Utc::now(), text)
    }

    pub fn at(timestamp: DateTime<Utc>, text: impl Into<String>) -> Self {
        Self {
            timestamp,
            text: text.into(),
        }
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.text
        )
    }
}

/// Bounded tail of the current run's output. The oldest lines are evicted
/// first once `capacity` is reached.
#[derive(Debug)]
pub struct LogRingBuffer {
    lines: Mutex<VecDeque<LogLine>>,
    capacity: usize,
}

impl LogRingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    pub fn append(&self, line: LogLine) {
        let mut guard = self.lines.lock();
        while guard.len() >= self.capacity {
            guard.pop_front();
        }
        guard.push_back(line);
    }

    /// Returns the last `min(n, len)` lines, oldest first.
    pub fn recent(&self, n: usize) -> Vec<LogLine> {
        let guard = self.lines.lock();
        let skip = guard.len().saturating_sub(n);
        guard.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

impl Default for LogRingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}
