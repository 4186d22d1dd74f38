//! Enforcement sessions and the session store.
//!
//! One `EnforcementSession` exists per user per day while the morning plan
//! is outstanding. The store is the only mutable shared state in the engine:
//! a single mutex over the session map with short critical sections, every
//! mutation written through to the durable store before the lock drops.
//! That serializes a scheduler sweep against a manual completion or bypass
//! arriving concurrently for the same user.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::{MAX_LEVEL, MIN_LEVEL};
use crate::error::{EngineError, EngineResult};
use crate::store::StateStore;

/// Why a level transition happened. Reductions are only legal for the
/// explicitly reducing reasons; everything else is escalate-or-noop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelChangeReason {
    /// Deterministic time-based escalation from the sweep.
    TimeElapsed,
    /// The user accepted an adaptive suggestion.
    SuggestionAccepted,
    /// An emergency bypass dropped the level temporarily.
    BypassGranted,
    /// A bypass expired and the level was restored.
    BypassExpired,
    /// Hijack confirmation was declined; pinned to the Insist cap.
    HijackDeclined,
}

impl LevelChangeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LevelChangeReason::TimeElapsed => "time_elapsed",
            LevelChangeReason::SuggestionAccepted => "suggestion_accepted",
            LevelChangeReason::BypassGranted => "bypass_granted",
            LevelChangeReason::BypassExpired => "bypass_expired",
            LevelChangeReason::HijackDeclined => "hijack_declined",
        }
    }

    /// Whether this reason may lower the current level. Silent decay is
    /// never allowed; reductions must be one of these explicit transitions.
    fn allows_reduction(&self) -> bool {
        matches!(
            self,
            LevelChangeReason::SuggestionAccepted
                | LevelChangeReason::BypassGranted
                | LevelChangeReason::HijackDeclined
        )
    }
}

/// An adaptive suggestion awaiting the user's accept/decline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSuggestion {
    pub suggested_level: u8,
    pub delta: i8,
    pub raw_delta: i8,
    pub reason: String,
}

/// One user's enforcement state for the day.
#[derive(Debug, Clone, Serialize)]
pub struct EnforcementSession {
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub current_level: u8,
    pub escalation_count: u32,
    pub last_escalation_time: Option<DateTime<Utc>>,
    pub bypass_request_count: u32,
    pub completed: bool,
    pub completion_time: Option<DateTime<Utc>>,
    pub pending_suggestion: Option<PendingSuggestion>,
    /// A hijack activation is waiting on user confirmation.
    pub hijack_pending_confirmation: bool,
    /// Hijack was confirmed once this session; later activations (after a
    /// bypass, or tightening 9 → 10) need no second confirmation.
    pub hijack_confirmed: bool,
    /// Hijack was declined this session; the sweep holds the level at the
    /// Insist cap and re-prompts instead of re-entering the Hijack band.
    pub hijack_declined: bool,
}

impl EnforcementSession {
    pub fn new(user_id: String, initial_level: u8, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            start_time: now,
            current_level: initial_level,
            escalation_count: 0,
            last_escalation_time: None,
            bypass_request_count: 0,
            completed: false,
            completion_time: None,
            pending_suggestion: None,
            hijack_pending_confirmation: false,
            hijack_confirmed: false,
            hijack_declined: false,
        }
    }

    /// Whole minutes since the session opened. Always recomputed from
    /// `start_time`, never from a tick counter, so missed or duplicated
    /// sweeps can't skew escalation.
    pub fn elapsed_minutes(&self, now: DateTime<Utc>) -> u32 {
        let minutes = (now - self.start_time).num_minutes();
        minutes.max(0) as u32
    }
}

/// Outcome of an `apply_level` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelChange {
    pub user_id: String,
    pub from: u8,
    pub to: u8,
    /// False when the call was a safe no-op (duplicate tick, stale target).
    pub changed: bool,
}

/// Session map guarded by one mutex, persisted write-through.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, EnforcementSession>>,
    store: Arc<StateStore>,
}

impl SessionStore {
    /// Load persisted sessions so enforcement resumes across restarts.
    pub fn new(store: Arc<StateStore>) -> EngineResult<Self> {
        let mut sessions = HashMap::new();
        for session in store.load_sessions()? {
            if !session.completed {
                sessions.insert(session.user_id.clone(), session);
            }
        }
        Ok(Self {
            sessions: Mutex::new(sessions),
            store,
        })
    }

    /// Snapshot of a user's session, if one is active.
    pub fn get(&self, user_id: &str) -> Option<EnforcementSession> {
        self.sessions.lock().unwrap().get(user_id).cloned()
    }

    /// Users with an active session, for the sweep.
    pub fn active_users(&self) -> Vec<String> {
        self.sessions.lock().unwrap().keys().cloned().collect()
    }

    /// Open a session for the day's planning obligation.
    pub fn start(
        &self,
        user_id: &str,
        initial_level: u8,
        now: DateTime<Utc>,
    ) -> EngineResult<EnforcementSession> {
        validate_level(initial_level)?;
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(user_id) {
            return Err(EngineError::SessionAlreadyActive(user_id.to_string()));
        }
        let session = EnforcementSession::new(user_id.to_string(), initial_level, now);
        self.store.upsert_session(&session)?;
        sessions.insert(user_id.to_string(), session.clone());
        debug!(user = user_id, level = initial_level, "session started");
        Ok(session)
    }

    /// Apply a level transition.
    ///
    /// A target at or below the current level is a safe no-op unless the
    /// reason explicitly permits reduction. Escalations bump the counter
    /// and timestamp; every real change lands in the audit table.
    pub fn apply_level(
        &self,
        user_id: &str,
        new_level: u8,
        reason: LevelChangeReason,
        now: DateTime<Utc>,
    ) -> EngineResult<LevelChange> {
        validate_level(new_level)?;
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(user_id)
            .ok_or_else(|| EngineError::SessionNotFound(user_id.to_string()))?;

        let from = session.current_level;
        let is_noop =
            new_level == from || (new_level < from && !reason.allows_reduction());
        if is_noop {
            return Ok(LevelChange {
                user_id: user_id.to_string(),
                from,
                to: from,
                changed: false,
            });
        }

        session.current_level = new_level;
        if new_level > from {
            session.escalation_count += 1;
            session.last_escalation_time = Some(now);
        }
        self.store.upsert_session(session)?;
        self.store
            .record_transition(user_id, now, from, new_level, reason.as_str())?;
        debug!(
            user = user_id,
            from,
            to = new_level,
            reason = reason.as_str(),
            "level applied"
        );
        Ok(LevelChange {
            user_id: user_id.to_string(),
            from,
            to: new_level,
            changed: true,
        })
    }

    /// Mark the session complete and remove it from the store.
    pub fn complete(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<EnforcementSession> {
        let mut sessions = self.sessions.lock().unwrap();
        let mut session = sessions
            .remove(user_id)
            .ok_or_else(|| EngineError::SessionNotFound(user_id.to_string()))?;
        session.completed = true;
        session.completion_time = Some(now);
        self.store.delete_session(user_id)?;
        debug!(user = user_id, level = session.current_level, "session completed");
        Ok(session)
    }

    /// Clear every session at the calendar-day boundary.
    pub fn daily_reset(&self) -> EngineResult<usize> {
        let mut sessions = self.sessions.lock().unwrap();
        let cleared = sessions.len();
        sessions.clear();
        self.store.clear_all()?;
        Ok(cleared)
    }

    /// Mutate one session under the lock and persist the result.
    pub fn update<F>(&self, user_id: &str, mutate: F) -> EngineResult<EnforcementSession>
    where
        F: FnOnce(&mut EnforcementSession),
    {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(user_id)
            .ok_or_else(|| EngineError::SessionNotFound(user_id.to_string()))?;
        mutate(session);
        self.store.upsert_session(session)?;
        Ok(session.clone())
    }

    /// Remove and return the pending suggestion, if any.
    pub fn take_pending_suggestion(
        &self,
        user_id: &str,
    ) -> EngineResult<Option<PendingSuggestion>> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(user_id)
            .ok_or_else(|| EngineError::SessionNotFound(user_id.to_string()))?;
        let pending = session.pending_suggestion.take();
        self.store.upsert_session(session)?;
        Ok(pending)
    }
}

fn validate_level(level: u8) -> EngineResult<()> {
    if !(MIN_LEVEL..=MAX_LEVEL).contains(&level) {
        return Err(EngineError::InvalidLevel(level));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 7, 0, 0).unwrap()
    }

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(StateStore::open_in_memory().unwrap())).unwrap()
    }

    #[test]
    fn start_creates_and_duplicate_start_fails() {
        let sessions = store();
        let s = sessions.start("ada", 2, t0()).unwrap();
        assert_eq!(s.current_level, 2);
        assert_eq!(s.escalation_count, 0);

        let err = sessions.start("ada", 2, t0()).unwrap_err();
        assert!(matches!(err, EngineError::SessionAlreadyActive(_)));
    }

    #[test]
    fn escalation_bumps_counter_and_timestamp() {
        let sessions = store();
        sessions.start("ada", 2, t0()).unwrap();
        let later = t0() + chrono::Duration::minutes(31);

        let change = sessions
            .apply_level("ada", 3, LevelChangeReason::TimeElapsed, later)
            .unwrap();
        assert!(change.changed);
        assert_eq!((change.from, change.to), (2, 3));

        let s = sessions.get("ada").unwrap();
        assert_eq!(s.escalation_count, 1);
        assert_eq!(s.last_escalation_time, Some(later));
    }

    #[test]
    fn stale_target_is_a_noop_not_a_reduction() {
        let sessions = store();
        sessions.start("ada", 5, t0()).unwrap();

        let change = sessions
            .apply_level("ada", 3, LevelChangeReason::TimeElapsed, t0())
            .unwrap();
        assert!(!change.changed);
        assert_eq!(sessions.get("ada").unwrap().current_level, 5);
    }

    #[test]
    fn duplicate_tick_is_idempotent() {
        let sessions = store();
        sessions.start("ada", 2, t0()).unwrap();
        let later = t0() + chrono::Duration::minutes(31);

        sessions
            .apply_level("ada", 3, LevelChangeReason::TimeElapsed, later)
            .unwrap();
        let second = sessions
            .apply_level("ada", 3, LevelChangeReason::TimeElapsed, later)
            .unwrap();
        assert!(!second.changed);

        let s = sessions.get("ada").unwrap();
        assert_eq!(s.current_level, 3);
        assert_eq!(s.escalation_count, 1, "no double-escalation");
    }

    #[test]
    fn explicit_reduction_reasons_are_honored() {
        let sessions = store();
        sessions.start("ada", 2, t0()).unwrap();
        sessions
            .apply_level("ada", 9, LevelChangeReason::TimeElapsed, t0())
            .unwrap();

        let change = sessions
            .apply_level("ada", 6, LevelChangeReason::BypassGranted, t0())
            .unwrap();
        assert!(change.changed);
        assert_eq!(sessions.get("ada").unwrap().current_level, 6);

        let change = sessions
            .apply_level("ada", 5, LevelChangeReason::SuggestionAccepted, t0())
            .unwrap();
        assert!(change.changed);
        assert_eq!(sessions.get("ada").unwrap().current_level, 5);
    }

    #[test]
    fn invalid_levels_are_rejected() {
        let sessions = store();
        sessions.start("ada", 2, t0()).unwrap();
        assert!(matches!(
            sessions.apply_level("ada", 0, LevelChangeReason::TimeElapsed, t0()),
            Err(EngineError::InvalidLevel(0))
        ));
        assert!(matches!(
            sessions.apply_level("ada", 11, LevelChangeReason::TimeElapsed, t0()),
            Err(EngineError::InvalidLevel(11))
        ));
        assert!(matches!(
            sessions.start("bo", 0, t0()),
            Err(EngineError::InvalidLevel(0))
        ));
    }

    #[test]
    fn complete_removes_the_session() {
        let sessions = store();
        sessions.start("ada", 2, t0()).unwrap();
        let done = sessions.complete("ada", t0()).unwrap();
        assert!(done.completed);
        assert_eq!(done.completion_time, Some(t0()));
        assert!(sessions.get("ada").is_none());

        let err = sessions
            .apply_level("ada", 5, LevelChangeReason::TimeElapsed, t0())
            .unwrap_err();
        assert!(matches!(err, EngineError::SessionNotFound(_)));
    }

    #[test]
    fn daily_reset_clears_everything() {
        let sessions = store();
        sessions.start("ada", 2, t0()).unwrap();
        sessions.start("bo", 2, t0()).unwrap();
        assert_eq!(sessions.daily_reset().unwrap(), 2);
        assert!(sessions.active_users().is_empty());
    }

    #[test]
    fn sessions_survive_restart_via_store() {
        let backing = Arc::new(StateStore::open_in_memory().unwrap());
        {
            let sessions = SessionStore::new(Arc::clone(&backing)).unwrap();
            sessions.start("ada", 2, t0()).unwrap();
            sessions
                .apply_level("ada", 5, LevelChangeReason::TimeElapsed, t0())
                .unwrap();
        }
        let reloaded = SessionStore::new(backing).unwrap();
        let s = reloaded.get("ada").unwrap();
        assert_eq!(s.current_level, 5);
        assert_eq!(s.start_time, t0());
    }

    #[test]
    fn elapsed_minutes_recomputes_from_start_time() {
        let s = EnforcementSession::new("ada".to_string(), 2, t0());
        assert_eq!(s.elapsed_minutes(t0()), 0);
        assert_eq!(s.elapsed_minutes(t0() + chrono::Duration::minutes(31)), 31);
        // Clock skew backwards never underflows.
        assert_eq!(s.elapsed_minutes(t0() - chrono::Duration::minutes(5)), 0);
    }
}
