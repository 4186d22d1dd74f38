//! Emergency bypass — a bounded, temporary level reduction.
//!
//! A grant drops the session a fixed number of levels and carries a durable
//! `expires_at` timestamp in the state store. Reversion is dual-triggered:
//! the daemon's timer loop and every scheduler sweep both call
//! `reconcile`, and an elapsed `expires_at` is authoritative even when the
//! in-memory timer was lost to a restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::catalog::MIN_LEVEL;
use crate::error::{EngineError, EngineResult};
use crate::policy::EscalationSchedule;
use crate::session::{LevelChangeReason, SessionStore};
use crate::store::StateStore;

/// One temporary level reduction.
#[derive(Debug, Clone, Serialize)]
pub struct BypassGrant {
    pub id: Uuid,
    pub user_id: String,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub original_level: u8,
    pub temporary_level: u8,
    pub reason: String,
}

/// A bypass that `reconcile` reverted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BypassReversion {
    pub user_id: String,
    pub restored_level: u8,
}

pub struct BypassManager {
    grants: Mutex<HashMap<String, BypassGrant>>,
    store: Arc<StateStore>,
}

impl BypassManager {
    /// Load persisted grants so expiry survives restarts.
    pub fn new(store: Arc<StateStore>) -> EngineResult<Self> {
        let mut grants = HashMap::new();
        for grant in store.load_grants()? {
            grants.insert(grant.user_id.clone(), grant);
        }
        Ok(Self {
            grants: Mutex::new(grants),
            store,
        })
    }

    /// Grant a bypass: drop the session `reduction` levels (floored at 1)
    /// for `duration_minutes`.
    pub fn grant(
        &self,
        sessions: &SessionStore,
        user_id: &str,
        duration_minutes: u32,
        reason: &str,
        min_bypass_level: u8,
        reduction: u8,
        now: DateTime<Utc>,
    ) -> EngineResult<BypassGrant> {
        let session = sessions
            .get(user_id)
            .ok_or_else(|| EngineError::SessionNotFound(user_id.to_string()))?;

        {
            let grants = self.grants.lock().unwrap();
            if grants.contains_key(user_id) {
                return Err(EngineError::BypassAlreadyActive(user_id.to_string()));
            }
        }
        if session.current_level < min_bypass_level {
            return Err(EngineError::BypassNotEligible {
                current: session.current_level,
                minimum: min_bypass_level,
            });
        }

        let original_level = session.current_level;
        let temporary_level = original_level.saturating_sub(reduction).max(MIN_LEVEL);
        let grant = BypassGrant {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            granted_at: now,
            expires_at: now + Duration::minutes(duration_minutes as i64),
            original_level,
            temporary_level,
            reason: reason.to_string(),
        };

        self.store.insert_grant(&grant)?;
        sessions.apply_level(user_id, temporary_level, LevelChangeReason::BypassGranted, now)?;
        self.grants
            .lock()
            .unwrap()
            .insert(user_id.to_string(), grant.clone());

        info!(
            user = user_id,
            from = original_level,
            to = temporary_level,
            expires_at = %grant.expires_at,
            "bypass granted"
        );
        Ok(grant)
    }

    /// Revert every grant whose expiry has passed.
    ///
    /// The restored level is the higher of the pre-bypass level and the
    /// schedule's target for the session's total elapsed time, so time that
    /// passed inside the bypass window still counts.
    pub fn reconcile(
        &self,
        sessions: &SessionStore,
        schedule: &EscalationSchedule,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<BypassReversion>> {
        let expired: Vec<BypassGrant> = {
            let grants = self.grants.lock().unwrap();
            grants
                .values()
                .filter(|g| now >= g.expires_at)
                .cloned()
                .collect()
        };

        let mut reverted = Vec::new();
        for grant in expired {
            self.store.delete_grant(&grant.user_id)?;
            self.grants.lock().unwrap().remove(&grant.user_id);

            let Some(session) = sessions.get(&grant.user_id) else {
                // Session completed during the bypass window; nothing to
                // restore.
                debug!(user = %grant.user_id, "expired grant for finished session dropped");
                continue;
            };

            let time_target = schedule.target_level_for_elapsed(session.elapsed_minutes(now));
            let restored_level = grant.original_level.max(time_target);
            sessions.apply_level(
                &grant.user_id,
                restored_level,
                LevelChangeReason::BypassExpired,
                now,
            )?;
            info!(user = %grant.user_id, restored_level, "bypass expired, level restored");
            reverted.push(BypassReversion {
                user_id: grant.user_id,
                restored_level,
            });
        }
        Ok(reverted)
    }

    /// Drop a user's grant without reverting (session completed).
    pub fn cancel(&self, user_id: &str) -> EngineResult<()> {
        if self.grants.lock().unwrap().remove(user_id).is_some() {
            self.store.delete_grant(user_id)?;
        }
        Ok(())
    }

    /// Clear all grants (daily reset; the store rows go with `clear_all`).
    pub fn reset(&self) {
        self.grants.lock().unwrap().clear();
    }

    /// Snapshot of the active grant for a user.
    pub fn active_grant(&self, user_id: &str) -> Option<BypassGrant> {
        self.grants.lock().unwrap().get(user_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 7, 0, 0).unwrap()
    }

    fn setup() -> (Arc<StateStore>, SessionStore, BypassManager) {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let sessions = SessionStore::new(Arc::clone(&store)).unwrap();
        let bypass = BypassManager::new(Arc::clone(&store)).unwrap();
        (store, sessions, bypass)
    }

    fn escalate_to(sessions: &SessionStore, user: &str, level: u8) {
        sessions
            .apply_level(user, level, LevelChangeReason::TimeElapsed, t0())
            .unwrap();
    }

    #[test]
    fn grant_drops_three_levels_and_persists_expiry() {
        let (_, sessions, bypass) = setup();
        sessions.start("ada", 2, t0()).unwrap();
        escalate_to(&sessions, "ada", 9);

        let grant = bypass
            .grant(&sessions, "ada", 30, "doctor call", 8, 3, t0())
            .unwrap();
        assert_eq!(grant.original_level, 9);
        assert_eq!(grant.temporary_level, 6);
        assert_eq!(grant.expires_at, t0() + Duration::minutes(30));
        assert!(grant.temporary_level < grant.original_level);
        assert!(grant.expires_at > grant.granted_at);
        assert_eq!(sessions.get("ada").unwrap().current_level, 6);
    }

    #[test]
    fn grant_floors_at_level_one() {
        let (_, sessions, bypass) = setup();
        sessions.start("ada", 2, t0()).unwrap();
        escalate_to(&sessions, "ada", 8);

        let grant = bypass
            .grant(&sessions, "ada", 30, "x", 8, 9, t0())
            .unwrap();
        assert_eq!(grant.temporary_level, 1);
    }

    #[test]
    fn below_minimum_is_not_eligible() {
        let (_, sessions, bypass) = setup();
        sessions.start("ada", 2, t0()).unwrap();
        escalate_to(&sessions, "ada", 5);

        let err = bypass
            .grant(&sessions, "ada", 30, "x", 8, 3, t0())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::BypassNotEligible {
                current: 5,
                minimum: 8
            }
        ));
        assert_eq!(sessions.get("ada").unwrap().current_level, 5);
    }

    #[test]
    fn second_grant_is_rejected() {
        let (_, sessions, bypass) = setup();
        sessions.start("ada", 2, t0()).unwrap();
        escalate_to(&sessions, "ada", 9);

        bypass.grant(&sessions, "ada", 30, "x", 8, 3, t0()).unwrap();
        let err = bypass
            .grant(&sessions, "ada", 30, "y", 8, 3, t0())
            .unwrap_err();
        assert!(matches!(err, EngineError::BypassAlreadyActive(_)));
    }

    #[test]
    fn reconcile_before_expiry_does_nothing() {
        let (_, sessions, bypass) = setup();
        sessions.start("ada", 2, t0()).unwrap();
        escalate_to(&sessions, "ada", 9);
        bypass.grant(&sessions, "ada", 30, "x", 8, 3, t0()).unwrap();

        let schedule = EscalationSchedule::default();
        let reverted = bypass
            .reconcile(&sessions, &schedule, t0() + Duration::minutes(29))
            .unwrap();
        assert!(reverted.is_empty());
        assert_eq!(sessions.get("ada").unwrap().current_level, 6);
    }

    #[test]
    fn reconcile_restores_original_level_at_expiry() {
        let (_, sessions, bypass) = setup();
        // Session started long enough ago that level 9 was manual, not
        // time-driven: elapsed at expiry stays under the 180m → 10 line.
        sessions.start("ada", 2, t0()).unwrap();
        escalate_to(&sessions, "ada", 9);
        bypass.grant(&sessions, "ada", 30, "x", 8, 3, t0()).unwrap();

        let schedule = EscalationSchedule::default();
        let reverted = bypass
            .reconcile(&sessions, &schedule, t0() + Duration::minutes(30))
            .unwrap();
        assert_eq!(
            reverted,
            vec![BypassReversion {
                user_id: "ada".to_string(),
                restored_level: 9
            }]
        );
        assert_eq!(sessions.get("ada").unwrap().current_level, 9);
        assert!(bypass.active_grant("ada").is_none());
    }

    #[test]
    fn reconcile_escalates_past_original_when_time_justifies() {
        let (_, sessions, bypass) = setup();
        sessions.start("ada", 2, t0()).unwrap();
        // 160 minutes in, level 8 per schedule.
        let t160 = t0() + Duration::minutes(160);
        escalate_to(&sessions, "ada", 8);
        bypass
            .grant(&sessions, "ada", 30, "x", 8, 3, t160)
            .unwrap();

        // Expiry lands at 190 minutes elapsed → schedule target is 10.
        let schedule = EscalationSchedule::default();
        let reverted = bypass
            .reconcile(&sessions, &schedule, t160 + Duration::minutes(30))
            .unwrap();
        assert_eq!(reverted[0].restored_level, 10);
        assert_eq!(sessions.get("ada").unwrap().current_level, 10);
    }

    #[test]
    fn expiry_survives_restart() {
        let (store, sessions, bypass) = setup();
        sessions.start("ada", 2, t0()).unwrap();
        escalate_to(&sessions, "ada", 9);
        bypass.grant(&sessions, "ada", 30, "x", 8, 3, t0()).unwrap();
        drop(bypass);

        // A fresh manager over the same store sees the durable grant.
        let revived = BypassManager::new(Arc::clone(&store)).unwrap();
        let grant = revived.active_grant("ada").unwrap();
        assert_eq!(grant.expires_at, t0() + Duration::minutes(30));

        let schedule = EscalationSchedule::default();
        let reverted = revived
            .reconcile(&sessions, &schedule, t0() + Duration::minutes(45))
            .unwrap();
        assert_eq!(reverted.len(), 1);
        assert_eq!(sessions.get("ada").unwrap().current_level, 9);
    }

    #[test]
    fn grant_for_finished_session_is_dropped_quietly() {
        let (_, sessions, bypass) = setup();
        sessions.start("ada", 2, t0()).unwrap();
        escalate_to(&sessions, "ada", 9);
        bypass.grant(&sessions, "ada", 30, "x", 8, 3, t0()).unwrap();
        sessions.complete("ada", t0() + Duration::minutes(10)).unwrap();

        let schedule = EscalationSchedule::default();
        let reverted = bypass
            .reconcile(&sessions, &schedule, t0() + Duration::minutes(31))
            .unwrap();
        assert!(reverted.is_empty());
        assert!(bypass.active_grant("ada").is_none());
    }
}
