//! Structured JSONL run records.
//!
//! One line per event, written to stdout or a file. Fields are optional
//! context; `timestamp_ms`, `level`, and `event` are always present.

use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Severity level for run records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Canonical run record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp_ms: u64,
    pub level: LogLevel,
    pub event: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_periods: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_barriers: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_value: Option<u64>,
}

impl LogEntry {
    pub fn new(level: LogLevel, event: impl Into<String>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            timestamp_ms,
            level,
            event: event.into(),
            thread: None,
            iterations: None,
            sum: None,
            elapsed_ms: None,
            grace_periods: None,
            master_barriers: None,
            final_value: None,
        }
    }
}

/// Serialized, line-buffered JSONL sink shared across worker threads.
pub struct LogEmitter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl LogEmitter {
    pub fn stdout() -> Self {
        Self {
            out: Mutex::new(Box::new(std::io::stdout())),
        }
    }

    pub fn to_file(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self {
            out: Mutex::new(Box::new(file)),
        })
    }

    /// A sink that drops everything; for tests that only want the summary.
    pub fn sink() -> Self {
        Self {
            out: Mutex::new(Box::new(std::io::sink())),
        }
    }

    pub fn emit(&self, entry: &LogEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(out, "{line}")
    }
}
