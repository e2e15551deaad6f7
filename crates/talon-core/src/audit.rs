use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::error::Result;
use crate::types::{LogLevel, LogRecord};

/// Destination for the append-only audit stream.
pub trait AuditSink: Send + Sync + 'static {
    fn append(&self, record: LogRecord) -> Result<()>;
}

/// Logging handle shared by the engines.
///
/// A sink failure is reported via `tracing` and dropped: audit logging
/// must never stall or corrupt in-memory engine progress. Durable
/// checkpoints go through the workflow store, which does surface errors.
#[derive(Clone)]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// A log backed by an in-memory sink, returned alongside the sink so
    /// tests can inspect what was written.
    pub fn in_memory() -> (Self, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        (Self::new(sink.clone()), sink)
    }

    pub fn record(&self, record: LogRecord) {
        if let Err(e) = self.sink.append(record) {
            warn!(error = %e, "Audit sink rejected record");
        }
    }

    pub fn info(&self, message: impl Into<String>, context: serde_json::Value) {
        self.record(LogRecord::new(LogLevel::Info, message, context));
    }

    pub fn warn(&self, message: impl Into<String>, context: serde_json::Value) {
        self.record(LogRecord::new(LogLevel::Warn, message, context));
    }

    pub fn error(&self, message: impl Into<String>, context: serde_json::Value) {
        self.record(LogRecord::new(LogLevel::Error, message, context));
    }
}

/// In-memory sink for tests and ephemeral runs.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Messages only, in append order.
    pub fn messages(&self) -> Vec<String> {
        self.records()
            .into_iter()
            .map(|r| r.message)
            .collect()
    }
}

impl AuditSink for MemorySink {
    fn append(&self, record: LogRecord) -> Result<()> {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
        Ok(())
    }
}
