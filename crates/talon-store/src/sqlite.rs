use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection};
use tracing::debug;

use talon_core::audit::AuditSink;
use talon_core::error::{Result, TalonError};
use talon_core::traits::{AgentStore, WorkflowStore};
use talon_core::types::{
    AgentRecord, LogLevel, LogRecord, WorkflowId, WorkflowSnapshot, WorkflowStatus,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS agents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        agent_id TEXT NOT NULL UNIQUE,
        record_json TEXT NOT NULL,
        registered_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        instance_json TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        level TEXT NOT NULL,
        message TEXT NOT NULL,
        context_json TEXT NOT NULL,
        workflow_id TEXT,
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_audit_workflow
        ON audit_log(workflow_id, id);";

/// SQLite-backed store for agents, workflow checkpoints, and the
/// append-only audit log.
///
/// Registration order of agents is the insertion order of the `agents`
/// table (AUTOINCREMENT rowid); capability resolution ties break on it.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TalonError::Persistence(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn =
            Connection::open(path).map_err(|e| TalonError::Persistence(e.to_string()))?;

        // WAL for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| TalonError::Persistence(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| TalonError::Persistence(e.to_string()))?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| TalonError::Persistence(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| TalonError::Persistence(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| TalonError::Persistence(e.to_string()))
    }

    /// The most recent audit records, newest first.
    pub fn recent_logs(&self, limit: usize) -> Result<Vec<LogRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT level, message, context_json, timestamp
                 FROM audit_log ORDER BY id DESC LIMIT ?1",
            )
            .map_err(|e| TalonError::Persistence(e.to_string()))?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_log_record)
            .map_err(|e| TalonError::Persistence(e.to_string()))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| TalonError::Persistence(e.to_string()))
    }

    /// All audit records for one workflow, in append order.
    pub fn logs_for(&self, workflow_id: &WorkflowId, limit: usize) -> Result<Vec<LogRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT level, message, context_json, timestamp
                 FROM audit_log WHERE workflow_id = ?1 ORDER BY id LIMIT ?2",
            )
            .map_err(|e| TalonError::Persistence(e.to_string()))?;
        let rows = stmt
            .query_map(params![workflow_id.0, limit as i64], row_to_log_record)
            .map_err(|e| TalonError::Persistence(e.to_string()))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| TalonError::Persistence(e.to_string()))
    }
}

fn row_to_log_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogRecord> {
    let level: String = row.get(0)?;
    let context_json: String = row.get(2)?;
    let ts: String = row.get(3)?;
    Ok(LogRecord {
        level: match level.as_str() {
            "debug" => LogLevel::Debug,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        },
        message: row.get(1)?,
        context: serde_json::from_str(&context_json).unwrap_or(serde_json::Value::Null),
        timestamp: parse_timestamp(&ts),
    })
}

fn parse_timestamp(ts: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_status(s: &str) -> WorkflowStatus {
    match s {
        "pending" => WorkflowStatus::Pending,
        "running" => WorkflowStatus::Running,
        "paused" => WorkflowStatus::Paused,
        "completed" => WorkflowStatus::Completed,
        "cancelled" => WorkflowStatus::Cancelled,
        _ => WorkflowStatus::Failed,
    }
}

impl AgentStore for SqliteStore {
    fn load_agents(&self) -> BoxFuture<'_, Result<Vec<AgentRecord>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare("SELECT record_json FROM agents ORDER BY id")
                .map_err(|e| TalonError::Persistence(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| TalonError::Persistence(e.to_string()))?;

            let mut agents = Vec::new();
            for row in rows {
                let json = row.map_err(|e| TalonError::Persistence(e.to_string()))?;
                agents.push(serde_json::from_str(&json)?);
            }
            Ok(agents)
        })
    }

    fn register_agent(&self, record: AgentRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let json = serde_json::to_string(&record)?;
            let conn = self.lock()?;
            // Re-registration takes a fresh position in registration order
            conn.execute(
                "DELETE FROM agents WHERE agent_id = ?1",
                params![record.agent_id],
            )
            .map_err(|e| TalonError::Persistence(e.to_string()))?;
            conn.execute(
                "INSERT INTO agents (agent_id, record_json, registered_at) VALUES (?1, ?2, ?3)",
                params![record.agent_id, json, Utc::now().to_rfc3339()],
            )
            .map_err(|e| TalonError::Persistence(e.to_string()))?;
            Ok(())
        })
    }

    fn unregister_agent(&self, agent_id: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute("DELETE FROM agents WHERE agent_id = ?1", params![agent_id])
                .map_err(|e| TalonError::Persistence(e.to_string()))?;
            Ok(())
        })
    }
}

impl WorkflowStore for SqliteStore {
    fn save(&self, snapshot: WorkflowSnapshot) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO workflows (id, status, instance_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                     status = excluded.status,
                     instance_json = excluded.instance_json,
                     updated_at = excluded.updated_at",
                params![
                    snapshot.id.0,
                    snapshot.status.to_string(),
                    snapshot.instance_json,
                    snapshot.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| TalonError::Persistence(e.to_string()))?;
            Ok(())
        })
    }

    fn load(&self, id: WorkflowId) -> BoxFuture<'_, Result<Option<WorkflowSnapshot>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare("SELECT status, instance_json, updated_at FROM workflows WHERE id = ?1")
                .map_err(|e| TalonError::Persistence(e.to_string()))?;

            let snapshot = stmt
                .query_row(params![id.0], |row| {
                    let status: String = row.get(0)?;
                    let ts: String = row.get(2)?;
                    Ok(WorkflowSnapshot {
                        id: id.clone(),
                        status: parse_status(&status),
                        instance_json: row.get(1)?,
                        updated_at: parse_timestamp(&ts),
                    })
                })
                .ok();
            Ok(snapshot)
        })
    }

    fn delete(&self, id: WorkflowId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute("DELETE FROM workflows WHERE id = ?1", params![id.0])
                .map_err(|e| TalonError::Persistence(e.to_string()))?;
            Ok(())
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<(WorkflowId, WorkflowStatus)>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare("SELECT id, status FROM workflows ORDER BY updated_at DESC")
                .map_err(|e| TalonError::Persistence(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| {
                    let id: String = row.get(0)?;
                    let status: String = row.get(1)?;
                    Ok((WorkflowId(id), parse_status(&status)))
                })
                .map_err(|e| TalonError::Persistence(e.to_string()))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| TalonError::Persistence(e.to_string()))
        })
    }
}

impl AuditSink for SqliteStore {
    fn append(&self, record: LogRecord) -> Result<()> {
        let workflow_id = record
            .context
            .get("workflow_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO audit_log (level, message, context_json, workflow_id, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.level.to_string(),
                record.message,
                record.context.to_string(),
                workflow_id,
                record.timestamp.to_rfc3339(),
            ],
        )
        .map_err(|e| TalonError::Persistence(e.to_string()))?;
        Ok(())
    }
}
