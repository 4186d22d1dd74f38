//! Durable state store — sessions and bypass grants in SQLite.
//!
//! The engine's truth lives in memory behind `SessionStore`; every mutation
//! is written through here so sessions and bypass expiry timestamps survive
//! a process restart. A small transitions table keeps a queryable audit
//! trail alongside the JSONL log.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::bypass::BypassGrant;
use crate::error::EngineResult;
use crate::session::{EnforcementSession, PendingSuggestion};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    user_id               TEXT PRIMARY KEY,
    start_time            INTEGER NOT NULL,
    current_level         INTEGER NOT NULL,
    escalation_count      INTEGER NOT NULL,
    last_escalation_time  INTEGER,
    bypass_request_count  INTEGER NOT NULL,
    completed             INTEGER NOT NULL,
    completion_time       INTEGER,
    pending_suggestion    TEXT,
    hijack_pending        INTEGER NOT NULL DEFAULT 0,
    hijack_confirmed      INTEGER NOT NULL DEFAULT 0,
    hijack_declined       INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS bypass_grants (
    id               TEXT PRIMARY KEY,
    user_id          TEXT NOT NULL UNIQUE,
    granted_at       INTEGER NOT NULL,
    expires_at       INTEGER NOT NULL,
    original_level   INTEGER NOT NULL,
    temporary_level  INTEGER NOT NULL,
    reason           TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS transitions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     TEXT NOT NULL,
    at          INTEGER NOT NULL,
    from_level  INTEGER NOT NULL,
    to_level    INTEGER NOT NULL,
    reason      TEXT NOT NULL
);
";

fn to_epoch(ts: DateTime<Utc>) -> i64 {
    ts.timestamp()
}

fn from_epoch(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default()
}

/// SQLite-backed durable store, one connection behind a mutex.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open (or create) the state database at `path` and apply the schema.
    pub fn open(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            // Parent creation failures surface as the open error below.
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests and ephemeral runs.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace a session row.
    pub fn upsert_session(&self, session: &EnforcementSession) -> EngineResult<()> {
        let pending = session
            .pending_suggestion
            .as_ref()
            .map(|s| serde_json::to_string(s).unwrap_or_default());
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO sessions (
                user_id, start_time, current_level, escalation_count,
                last_escalation_time, bypass_request_count, completed,
                completion_time, pending_suggestion, hijack_pending,
                hijack_confirmed, hijack_declined
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                session.user_id,
                to_epoch(session.start_time),
                session.current_level,
                session.escalation_count,
                session.last_escalation_time.map(to_epoch),
                session.bypass_request_count,
                session.completed,
                session.completion_time.map(to_epoch),
                pending,
                session.hijack_pending_confirmation,
                session.hijack_confirmed,
                session.hijack_declined,
            ],
        )?;
        Ok(())
    }

    /// Delete a session row (completion or daily reset).
    pub fn delete_session(&self, user_id: &str) -> EngineResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM sessions WHERE user_id = ?1", params![user_id])?;
        Ok(())
    }

    /// Load all persisted sessions (startup recovery).
    pub fn load_sessions(&self) -> EngineResult<Vec<EnforcementSession>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT user_id, start_time, current_level, escalation_count,
                    last_escalation_time, bypass_request_count, completed,
                    completion_time, pending_suggestion, hijack_pending,
                    hijack_confirmed, hijack_declined
             FROM sessions",
        )?;
        let rows = stmt.query_map([], |row| {
            let pending_json: Option<String> = row.get(8)?;
            let pending: Option<PendingSuggestion> = pending_json
                .as_deref()
                .and_then(|json| serde_json::from_str(json).ok());
            Ok(EnforcementSession {
                user_id: row.get(0)?,
                start_time: from_epoch(row.get(1)?),
                current_level: row.get(2)?,
                escalation_count: row.get(3)?,
                last_escalation_time: row.get::<_, Option<i64>>(4)?.map(from_epoch),
                bypass_request_count: row.get(5)?,
                completed: row.get(6)?,
                completion_time: row.get::<_, Option<i64>>(7)?.map(from_epoch),
                pending_suggestion: pending,
                hijack_pending_confirmation: row.get(9)?,
                hijack_confirmed: row.get(10)?,
                hijack_declined: row.get(11)?,
            })
        })?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        debug!(count = sessions.len(), "loaded persisted sessions");
        Ok(sessions)
    }

    /// Insert a bypass grant. The UNIQUE constraint on `user_id` enforces
    /// one active grant per session.
    pub fn insert_grant(&self, grant: &BypassGrant) -> EngineResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO bypass_grants (
                id, user_id, granted_at, expires_at,
                original_level, temporary_level, reason
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                grant.id.to_string(),
                grant.user_id,
                to_epoch(grant.granted_at),
                to_epoch(grant.expires_at),
                grant.original_level,
                grant.temporary_level,
                grant.reason,
            ],
        )?;
        Ok(())
    }

    /// Delete the grant for a user (reversion or reset).
    pub fn delete_grant(&self, user_id: &str) -> EngineResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM bypass_grants WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(())
    }

    /// Load all persisted grants (startup recovery; expired grants are
    /// reconciled by the first sweep, not dropped here).
    pub fn load_grants(&self) -> EngineResult<Vec<BypassGrant>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, granted_at, expires_at,
                    original_level, temporary_level, reason
             FROM bypass_grants",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            Ok(BypassGrant {
                id: id.parse().unwrap_or_else(|_| uuid::Uuid::nil()),
                user_id: row.get(1)?,
                granted_at: from_epoch(row.get(2)?),
                expires_at: from_epoch(row.get(3)?),
                original_level: row.get(4)?,
                temporary_level: row.get(5)?,
                reason: row.get(6)?,
            })
        })?;
        let mut grants = Vec::new();
        for row in rows {
            grants.push(row?);
        }
        Ok(grants)
    }

    /// Record one level transition in the audit table.
    pub fn record_transition(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
        from_level: u8,
        to_level: u8,
        reason: &str,
    ) -> EngineResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO transitions (user_id, at, from_level, to_level, reason)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, to_epoch(at), from_level, to_level, reason],
        )?;
        Ok(())
    }

    /// Count audit rows for a user (observability / tests).
    pub fn transition_count(&self, user_id: &str) -> EngineResult<u32> {
        let conn = self.conn.lock().unwrap();
        let count: Option<u32> = conn
            .query_row(
                "SELECT COUNT(*) FROM transitions WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0))
    }

    /// Clear every session and grant (daily reset). Returns the number of
    /// sessions removed.
    pub fn clear_all(&self) -> EngineResult<usize> {
        let conn = self.conn.lock().unwrap();
        let cleared = conn.execute("DELETE FROM sessions", [])?;
        conn.execute("DELETE FROM bypass_grants", [])?;
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::EnforcementSession;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 7, 0, 0).unwrap()
    }

    fn session(user: &str) -> EnforcementSession {
        EnforcementSession::new(user.to_string(), 2, t0())
    }

    #[test]
    fn session_round_trips_through_sqlite() {
        let store = StateStore::open_in_memory().unwrap();
        let mut s = session("ada");
        s.current_level = 7;
        s.escalation_count = 3;
        s.last_escalation_time = Some(t0() + chrono::Duration::minutes(90));
        s.pending_suggestion = Some(PendingSuggestion {
            suggested_level: 6,
            delta: -1,
            raw_delta: -1,
            reason: "overwhelm".to_string(),
        });
        store.upsert_session(&s).unwrap();

        let loaded = store.load_sessions().unwrap();
        assert_eq!(loaded.len(), 1);
        let l = &loaded[0];
        assert_eq!(l.user_id, "ada");
        assert_eq!(l.current_level, 7);
        assert_eq!(l.escalation_count, 3);
        assert_eq!(l.start_time, t0());
        assert_eq!(
            l.last_escalation_time,
            Some(t0() + chrono::Duration::minutes(90))
        );
        assert_eq!(l.pending_suggestion.as_ref().unwrap().suggested_level, 6);
        assert!(!l.completed);
    }

    #[test]
    fn grants_persist_with_expiry() {
        let store = StateStore::open_in_memory().unwrap();
        let grant = BypassGrant {
            id: uuid::Uuid::new_v4(),
            user_id: "ada".to_string(),
            granted_at: t0(),
            expires_at: t0() + chrono::Duration::minutes(30),
            original_level: 9,
            temporary_level: 6,
            reason: "doctor call".to_string(),
        };
        store.insert_grant(&grant).unwrap();

        let loaded = store.load_grants().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].expires_at, grant.expires_at);
        assert_eq!(loaded[0].temporary_level, 6);

        store.delete_grant("ada").unwrap();
        assert!(store.load_grants().unwrap().is_empty());
    }

    #[test]
    fn second_grant_for_same_user_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let grant = BypassGrant {
            id: uuid::Uuid::new_v4(),
            user_id: "ada".to_string(),
            granted_at: t0(),
            expires_at: t0() + chrono::Duration::minutes(30),
            original_level: 9,
            temporary_level: 6,
            reason: "x".to_string(),
        };
        store.insert_grant(&grant).unwrap();

        let mut dup = grant.clone();
        dup.id = uuid::Uuid::new_v4();
        assert!(store.insert_grant(&dup).is_err());
    }

    #[test]
    fn clear_all_empties_both_tables() {
        let store = StateStore::open_in_memory().unwrap();
        store.upsert_session(&session("ada")).unwrap();
        store.upsert_session(&session("bo")).unwrap();

        let cleared = store.clear_all().unwrap();
        assert_eq!(cleared, 2);
        assert!(store.load_sessions().unwrap().is_empty());
    }

    #[test]
    fn transitions_accumulate() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .record_transition("ada", t0(), 2, 3, "time_elapsed")
            .unwrap();
        store
            .record_transition("ada", t0(), 3, 5, "time_elapsed")
            .unwrap();
        assert_eq!(store.transition_count("ada").unwrap(), 2);
        assert_eq!(store.transition_count("bo").unwrap(), 0);
    }

    #[test]
    fn reopens_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.db");
        {
            let store = StateStore::open(&path).unwrap();
            store.upsert_session(&session("ada")).unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        let loaded = store.load_sessions().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].user_id, "ada");
    }
}
