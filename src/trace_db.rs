//! SQLite-backed trace store: the audit trail of tool-invocation decisions,
//! user-issued corrections, and session turns.
//!
//! Design goals:
//!   - WAL mode so introspection reads never block in-flight turns
//!   - single-statement inserts: a record is either fully present or absent
//!   - append-only for audit and correction rows (only the corrections
//!     `applied` flag ever flips, and only from 0 to 1)

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use thiserror::Error;

use crate::{
    AuditDecision, AuditFilter, AuditRecord, CorrectionRecord, RiskTier, SessionTurn,
};

#[derive(Debug, Error)]
pub(crate) enum StoreError {
    #[error("storage failure: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("storage failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Owns the embedded database. Cheap to share behind an Arc; the connection
/// mutex is held per statement, never across a wait.
pub(crate) struct TraceStore {
    conn: Mutex<Connection>,
}

impl TraceStore {
    pub(crate) fn open_or_create(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS audit (
                 id       INTEGER PRIMARY KEY AUTOINCREMENT,
                 ts_utc   INTEGER NOT NULL,
                 session  TEXT NOT NULL,
                 tool     TEXT NOT NULL,
                 args     TEXT NOT NULL,
                 tier     TEXT NOT NULL,
                 decision TEXT NOT NULL,
                 summary  TEXT NOT NULL,
                 error    TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_audit_session ON audit(session, ts_utc);
             CREATE INDEX IF NOT EXISTS idx_audit_tool ON audit(tool, ts_utc);
             CREATE TABLE IF NOT EXISTS feedback (
                 id         INTEGER PRIMARY KEY AUTOINCREMENT,
                 ts_utc     INTEGER NOT NULL,
                 session    TEXT NOT NULL,
                 original   TEXT NOT NULL,
                 correction TEXT NOT NULL,
                 applied    INTEGER NOT NULL DEFAULT 0
             );
             CREATE TABLE IF NOT EXISTS turns (
                 id      INTEGER PRIMARY KEY AUTOINCREMENT,
                 ts_utc  INTEGER NOT NULL,
                 session TEXT NOT NULL,
                 role    TEXT NOT NULL,
                 content TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_turns_session ON turns(session, id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Audit trail ──────────────────────────────────────────────────────

    pub(crate) fn append_audit(&self, record: &AuditRecord) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO audit (ts_utc, session, tool, args, tier, decision, summary, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.ts_utc,
                record.session,
                record.tool,
                record.args,
                record.tier.as_str(),
                record.decision.as_str(),
                record.summary,
                record.error,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub(crate) fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, StoreError> {
        let mut sql = String::from(
            "SELECT id, ts_utc, session, tool, args, tier, decision, summary, error
             FROM audit WHERE 1=1",
        );
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(session) = &filter.session {
            sql.push_str(" AND session = ?");
            binds.push(Box::new(session.clone()));
        }
        if let Some(tool) = &filter.tool {
            sql.push_str(" AND tool = ?");
            binds.push(Box::new(tool.clone()));
        }
        if let Some(decision) = filter.decision {
            sql.push_str(" AND decision = ?");
            binds.push(Box::new(decision.as_str()));
        }
        sql.push_str(" ORDER BY ts_utc DESC, id DESC");
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        sql.push_str(" LIMIT ?");
        binds.push(Box::new(limit as i64));

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let params = rusqlite::params_from_iter(binds.iter().map(|b| b.as_ref()));
        let rows = stmt.query_map(params, |row| {
            let tier: String = row.get(5)?;
            let decision: String = row.get(6)?;
            Ok(AuditRecord {
                id: Some(row.get(0)?),
                ts_utc: row.get(1)?,
                session: row.get(2)?,
                tool: row.get(3)?,
                args: row.get(4)?,
                tier: RiskTier::from_db_str(&tier),
                decision: AuditDecision::from_db_str(&decision)
                    .unwrap_or(AuditDecision::Error),
                summary: row.get(7)?,
                error: row.get(8)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ── Corrections ──────────────────────────────────────────────────────

    pub(crate) fn save_correction(&self, record: &CorrectionRecord) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO feedback (ts_utc, session, original, correction, applied)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.ts_utc,
                record.session,
                record.original,
                record.correction,
                record.applied as i64,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub(crate) fn recent_corrections(
        &self,
        session: &str,
        limit: usize,
    ) -> Result<Vec<CorrectionRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, ts_utc, session, original, correction, applied
             FROM feedback WHERE session = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session, limit as i64], |row| {
            Ok(CorrectionRecord {
                id: Some(row.get(0)?),
                ts_utc: row.get(1)?,
                session: row.get(2)?,
                original: row.get(3)?,
                correction: row.get(4)?,
                applied: row.get::<_, i64>(5)? != 0,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Flip the applied flag after a correction has been folded into a
    /// prompt. One-way: never flips back.
    pub(crate) fn mark_correction_applied(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("UPDATE feedback SET applied = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub(crate) fn list_corrections(&self, limit: usize) -> Result<Vec<CorrectionRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, ts_utc, session, original, correction, applied
             FROM feedback ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(CorrectionRecord {
                id: Some(row.get(0)?),
                ts_utc: row.get(1)?,
                session: row.get(2)?,
                original: row.get(3)?,
                correction: row.get(4)?,
                applied: row.get::<_, i64>(5)? != 0,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ── Session turns ────────────────────────────────────────────────────

    pub(crate) fn append_turn(&self, session: &str, turn: &SessionTurn) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO turns (ts_utc, session, role, content) VALUES (?1, ?2, ?3, ?4)",
            params![turn.timestamp, session, turn.role, turn.content],
        )?;
        Ok(())
    }

    /// Last `limit` turns for a session, oldest first, ready to replay into
    /// a transcript.
    pub(crate) fn recent_turns(
        &self,
        session: &str,
        limit: usize,
    ) -> Result<Vec<SessionTurn>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT role, content, ts_utc FROM turns
             WHERE session = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session, limit as i64], |row| {
            Ok(SessionTurn {
                role: row.get(0)?,
                content: row.get(1)?,
                timestamp: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        out.reverse();
        Ok(out)
    }

    pub(crate) fn last_assistant_text(&self, session: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT content FROM turns
             WHERE session = ?1 AND role = 'assistant' ORDER BY id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![session])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::now_ts;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn temp_db_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("lodestar_test");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(format!("test_{}_{name}.sqlite", std::process::id()))
    }

    fn record(session: &str, tool: &str, decision: AuditDecision) -> AuditRecord {
        AuditRecord {
            id: None,
            ts_utc: now_ts(),
            session: session.to_string(),
            tool: tool.to_string(),
            args: r#"{"query":"vasp"}"#.to_string(),
            tier: RiskTier::Auto,
            decision,
            summary: "ok".to_string(),
            error: None,
        }
    }

    #[test]
    fn audit_round_trip() {
        let path = temp_db_path("audit_round_trip");
        let _ = std::fs::remove_file(&path);
        let store = TraceStore::open_or_create(&path).unwrap();

        let rec = record("s1", "arxiv_search", AuditDecision::Executed);
        store.append_audit(&rec).unwrap();

        let got = store
            .query_audit(&AuditFilter {
                session: Some("s1".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].tool, rec.tool);
        assert_eq!(got[0].args, rec.args);
        assert_eq!(got[0].decision, rec.decision);
        assert_eq!(got[0].tier, RiskTier::Auto);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn audit_filters_and_order() {
        let path = temp_db_path("audit_filters");
        let _ = std::fs::remove_file(&path);
        let store = TraceStore::open_or_create(&path).unwrap();

        store
            .append_audit(&record("s1", "mail_digest", AuditDecision::Executed))
            .unwrap();
        store
            .append_audit(&record("s1", "hpc_submit", AuditDecision::Rejected))
            .unwrap();
        store
            .append_audit(&record("s2", "mail_digest", AuditDecision::Error))
            .unwrap();

        let by_tool = store
            .query_audit(&AuditFilter {
                tool: Some("mail_digest".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_tool.len(), 2);

        let rejected = store
            .query_audit(&AuditFilter {
                decision: Some(AuditDecision::Rejected),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].tool, "hpc_submit");

        // Newest first within a session
        let s1 = store
            .query_audit(&AuditFilter {
                session: Some("s1".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(s1[0].tool, "hpc_submit");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn concurrent_appends_land_whole() {
        let path = temp_db_path("concurrent_appends");
        let _ = std::fs::remove_file(&path);
        let store = Arc::new(TraceStore::open_or_create(&path).unwrap());

        let mut handles = Vec::new();
        for t in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for i in 0..25 {
                    let rec = record(&format!("s{t}"), "arxiv_search", AuditDecision::Executed);
                    let _ = i;
                    store.append_audit(&rec).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let all = store
            .query_audit(&AuditFilter {
                limit: 500,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(all.len(), 200);
        for rec in all {
            assert_eq!(rec.args, r#"{"query":"vasp"}"#);
        }

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn corrections_applied_flag() {
        let path = temp_db_path("corrections");
        let _ = std::fs::remove_file(&path);
        let store = TraceStore::open_or_create(&path).unwrap();

        let id = store
            .save_correction(&CorrectionRecord {
                id: None,
                ts_utc: now_ts(),
                session: "s1".to_string(),
                original: "the meeting is at 3pm".to_string(),
                correction: "no, it's at 4pm".to_string(),
                applied: false,
            })
            .unwrap();

        let fresh = store.recent_corrections("s1", 5).unwrap();
        assert_eq!(fresh.len(), 1);
        assert!(!fresh[0].applied);

        store.mark_correction_applied(id).unwrap();
        let applied = store.recent_corrections("s1", 5).unwrap();
        assert!(applied[0].applied);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn turns_replay_in_order() {
        let path = temp_db_path("turns");
        let _ = std::fs::remove_file(&path);
        let store = TraceStore::open_or_create(&path).unwrap();

        for (role, content) in [("user", "hi"), ("assistant", "hello"), ("user", "bye")] {
            store
                .append_turn(
                    "s1",
                    &SessionTurn {
                        role: role.to_string(),
                        content: content.to_string(),
                        timestamp: now_ts(),
                    },
                )
                .unwrap();
        }

        let turns = store.recent_turns("s1", 2).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "hello");
        assert_eq!(turns[1].content, "bye");

        assert_eq!(
            store.last_assistant_text("s1").unwrap().as_deref(),
            Some("hello")
        );
        assert_eq!(store.last_assistant_text("s2").unwrap(), None);

        std::fs::remove_file(&path).ok();
    }
}
