//! Compact key/value format for fetch-worker log lines.
//!
//! ```text
//! {w:3,d:1.204s,m:fetched 512 bytes for candles}
//! ```
//!
//! Empty fields are left out, so `{m:done}` is a valid line.

use std::fmt;
use std::time::Duration;

/// One fetch-worker log line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerLog {
    /// Worker (fetch) number, starting at 1. Zero is omitted.
    pub worker_id: usize,
    /// Time the work took. Zero is omitted.
    pub duration: Duration,
    /// Message. Empty is omitted.
    pub msg: String,
}

impl WorkerLog {
    /// Creates a log line for `worker_id`.
    #[must_use]
    pub fn new(worker_id: usize, duration: Duration, msg: impl Into<String>) -> Self {
        Self {
            worker_id,
            duration,
            msg: msg.into(),
        }
    }
}

impl fmt::Display for WorkerLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields = Vec::with_capacity(3);
        if self.worker_id > 0 {
            fields.push(format!("w:{}", self.worker_id));
        }
        if !self.duration.is_zero() {
            fields.push(format!("d:{:?}", self.duration));
        }
        if !self.msg.is_empty() {
            fields.push(format!("m:{}", self.msg));
        }
        write!(f, "{{{}}}", fields.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_all_fields() {
        let line = WorkerLog::new(3, Duration::from_millis(1500), "fetched");
        assert_eq!(line.to_string(), "{w:3,d:1.5s,m:fetched}");
    }

    #[test]
    fn omits_empty_fields() {
        assert_eq!(
            WorkerLog::new(0, Duration::ZERO, "done").to_string(),
            "{m:done}"
        );
        assert_eq!(WorkerLog::new(2, Duration::ZERO, "").to_string(), "{w:2}");
        assert_eq!(WorkerLog::default().to_string(), "{}");
    }
}
