//! Per-run audit log (`audit.db`)
//!
//! Append-only event trail the core opens at create and closes at destroy.
//! Writes are best-effort from the caller's point of view; failures are
//! logged and never abort a lifecycle operation.

use crate::Result;
use chrono::Utc;
use rusqlite::Connection;
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;

/// A structured audit event
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub action: String,
    pub details: Value,
}

impl AuditEvent {
    pub fn new(action: impl Into<String>, details: Value) -> Self {
        Self {
            action: action.into(),
            details,
        }
    }
}

/// Handle to a run's audit database
pub struct AuditLog {
    conn: Mutex<Connection>,
}

impl AuditLog {
    /// Open (creating if needed) the audit database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                at TEXT NOT NULL,
                action TEXT NOT NULL,
                details TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append one event
    pub fn append(&self, event: &AuditEvent) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO events (at, action, details) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                Utc::now().to_rfc3339(),
                event.action,
                event.details.to_string()
            ],
        )?;
        Ok(())
    }

    /// Append, logging instead of failing
    pub fn append_best_effort(&self, event: &AuditEvent) {
        if let Err(e) = self.append(event) {
            tracing::warn!("Failed to append audit event '{}': {}", event.action, e);
        }
    }

    /// Number of recorded events (mainly for tests and status displays)
    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count)
    }

    /// All events for an action, oldest first
    pub fn events_for_action(&self, action: &str) -> Result<Vec<Value>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT details FROM events WHERE action = ?1 ORDER BY id ASC")?;
        let rows = stmt.query_map([action], |row| row.get::<_, String>(0))?;
        let mut events = Vec::new();
        for row in rows {
            let details: Value = serde_json::from_str(&row?)?;
            events.push(details);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_append_and_count() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::open(&tmp.path().join("audit.db")).unwrap();
        log.append(&AuditEvent::new("privileged", json!({"reason": "dind"})))
            .unwrap();
        log.append(&AuditEvent::new("ssh-sign", json!({"host": "github.com"})))
            .unwrap();
        assert_eq!(log.count().unwrap(), 2);
    }

    #[test]
    fn test_events_for_action() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::open(&tmp.path().join("audit.db")).unwrap();
        log.append(&AuditEvent::new("ssh-sign", json!({"fingerprint": "SHA256:a"})))
            .unwrap();
        log.append(&AuditEvent::new("other", json!({}))).unwrap();

        let events = log.events_for_action("ssh-sign").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["fingerprint"], "SHA256:a");
    }

    #[test]
    fn test_reopen_preserves_events() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit.db");
        {
            let log = AuditLog::open(&path).unwrap();
            log.append(&AuditEvent::new("x", json!({}))).unwrap();
        }
        let log = AuditLog::open(&path).unwrap();
        assert_eq!(log.count().unwrap(), 1);
    }
}
