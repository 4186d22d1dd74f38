//! Hijack controller — application restriction for levels 9 and 10.
//!
//! Owns the per-user `HijackState`; the scheduler reads it but never
//! mutates it. Activation into the Hijack band is confirmation-gated (the
//! pending/declined flags live on the session; this module only activates
//! once the engine has a confirmation in hand). Enforcement port failures
//! are recorded and retried on the next sweep — the controller's state is
//! the truth whether or not the external blocker answered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::MAX_LEVEL;
use crate::ports::EnforcementPort;

/// Restriction state for one user.
#[derive(Debug, Clone, Serialize)]
pub struct HijackState {
    pub active: bool,
    pub level: u8,
    pub allowed_apps: Vec<String>,
    pub escape_attempts: u32,
}

/// Enforcement call that failed and needs a retry on the next sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingEnforcement {
    Apply { level: u8 },
    Clear,
}

pub struct HijackController {
    states: Mutex<HashMap<String, HijackState>>,
    retries: Mutex<HashMap<String, PendingEnforcement>>,
    base_apps: Vec<String>,
    level9_apps: Vec<String>,
    enforcement: Arc<dyn EnforcementPort>,
}

impl HijackController {
    pub fn new(
        base_apps: Vec<String>,
        level9_apps: Vec<String>,
        enforcement: Arc<dyn EnforcementPort>,
    ) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            retries: Mutex::new(HashMap::new()),
            base_apps,
            level9_apps,
            enforcement,
        }
    }

    /// Allowed application set for a hijack level: level 10 is the minimal
    /// base set; level 9 adds the configured extensions.
    pub fn allowed_apps_for(&self, level: u8) -> Vec<String> {
        let mut apps = self.base_apps.clone();
        if level < MAX_LEVEL {
            apps.extend(self.level9_apps.iter().cloned());
        }
        apps
    }

    /// Engage (or tighten) hijack mode for a confirmed user.
    ///
    /// The state is recorded first; a failing enforcement call is queued
    /// for retry and never blocks the transition.
    pub fn activate(&self, user_id: &str, level: u8) -> HijackState {
        let allowed_apps = self.allowed_apps_for(level);
        let state = {
            let mut states = self.states.lock().unwrap();
            let entry = states.entry(user_id.to_string()).or_insert(HijackState {
                active: false,
                level,
                allowed_apps: vec![],
                escape_attempts: 0,
            });
            entry.active = true;
            entry.level = level;
            entry.allowed_apps = allowed_apps.clone();
            entry.clone()
        };

        info!(user = user_id, level, apps = ?allowed_apps, "hijack activated");
        match self.enforcement.set_allowed_apps(user_id, &allowed_apps) {
            Ok(()) => {
                self.retries.lock().unwrap().remove(user_id);
            }
            Err(err) => {
                warn!(user = user_id, error = %err, "enforcement apply failed; will retry");
                self.retries
                    .lock()
                    .unwrap()
                    .insert(user_id.to_string(), PendingEnforcement::Apply { level });
            }
        }
        state
    }

    /// Release hijack mode (completion or bypass).
    pub fn deactivate(&self, user_id: &str) {
        let was_active = self.states.lock().unwrap().remove(user_id).is_some();
        if !was_active {
            return;
        }
        info!(user = user_id, "hijack deactivated");
        match self.enforcement.clear(user_id) {
            Ok(()) => {
                self.retries.lock().unwrap().remove(user_id);
            }
            Err(err) => {
                warn!(user = user_id, error = %err, "enforcement clear failed; will retry");
                self.retries
                    .lock()
                    .unwrap()
                    .insert(user_id.to_string(), PendingEnforcement::Clear);
            }
        }
    }

    /// Count an attempt to leave the allowed set. Observability only; the
    /// level does not change. Returns the new count, or `None` when no
    /// hijack is active for the user.
    pub fn record_escape_attempt(&self, user_id: &str) -> Option<u32> {
        let mut states = self.states.lock().unwrap();
        let state = states.get_mut(user_id)?;
        if !state.active {
            return None;
        }
        state.escape_attempts += 1;
        Some(state.escape_attempts)
    }

    /// Snapshot of a user's hijack state.
    pub fn state(&self, user_id: &str) -> Option<HijackState> {
        self.states.lock().unwrap().get(user_id).cloned()
    }

    /// Whether hijack mode is currently engaged for the user.
    pub fn is_active(&self, user_id: &str) -> bool {
        self.states
            .lock()
            .unwrap()
            .get(user_id)
            .map(|s| s.active)
            .unwrap_or(false)
    }

    /// Retry enforcement calls that failed earlier. Called by every sweep.
    pub fn retry_failed(&self) {
        let pending: Vec<(String, PendingEnforcement)> = {
            let retries = self.retries.lock().unwrap();
            retries
                .iter()
                .map(|(user, action)| (user.clone(), action.clone()))
                .collect()
        };
        for (user_id, action) in pending {
            let result = match &action {
                PendingEnforcement::Apply { level } => {
                    let apps = self.allowed_apps_for(*level);
                    self.enforcement.set_allowed_apps(&user_id, &apps)
                }
                PendingEnforcement::Clear => self.enforcement.clear(&user_id),
            };
            match result {
                Ok(()) => {
                    self.retries.lock().unwrap().remove(&user_id);
                    info!(user = %user_id, "enforcement retry succeeded");
                }
                Err(err) => {
                    warn!(user = %user_id, error = %err, "enforcement retry failed");
                }
            }
        }
    }

    /// Number of enforcement calls waiting for retry (tests, status).
    pub fn pending_retries(&self) -> usize {
        self.retries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::testing::RecordingEnforcer;

    fn controller(enforcer: RecordingEnforcer) -> HijackController {
        HijackController::new(
            vec!["planner".to_string(), "notes".to_string()],
            vec!["timer".to_string()],
            Arc::new(enforcer),
        )
    }

    #[test]
    fn level_nine_gets_extensions_level_ten_base_only() {
        let c = controller(RecordingEnforcer::default());
        assert_eq!(c.allowed_apps_for(9), vec!["planner", "notes", "timer"]);
        assert_eq!(c.allowed_apps_for(10), vec!["planner", "notes"]);
    }

    #[test]
    fn activate_records_state_and_calls_enforcement() {
        let enforcer = RecordingEnforcer::default();
        let calls = enforcer.calls.clone();
        let c = controller(enforcer);

        let state = c.activate("ada", 9);
        assert!(state.active);
        assert_eq!(state.level, 9);
        assert_eq!(state.allowed_apps, vec!["planner", "notes", "timer"]);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "ada");
    }

    #[test]
    fn tightening_to_level_ten_keeps_escape_count() {
        let c = controller(RecordingEnforcer::default());
        c.activate("ada", 9);
        c.record_escape_attempt("ada");
        c.record_escape_attempt("ada");

        let state = c.activate("ada", 10);
        assert_eq!(state.level, 10);
        assert_eq!(state.escape_attempts, 2);
        assert_eq!(state.allowed_apps, vec!["planner", "notes"]);
    }

    #[test]
    fn escape_attempts_count_without_level_change() {
        let c = controller(RecordingEnforcer::default());
        assert_eq!(c.record_escape_attempt("ada"), None);

        c.activate("ada", 10);
        assert_eq!(c.record_escape_attempt("ada"), Some(1));
        assert_eq!(c.record_escape_attempt("ada"), Some(2));
        assert_eq!(c.state("ada").unwrap().level, 10);
    }

    #[test]
    fn deactivate_clears_state_and_apps() {
        let enforcer = RecordingEnforcer::default();
        let calls = enforcer.calls.clone();
        let c = controller(enforcer);

        c.activate("ada", 9);
        c.deactivate("ada");
        assert!(c.state("ada").is_none());
        assert!(!c.is_active("ada"));

        let calls = calls.lock().unwrap();
        // apply then clear
        assert_eq!(calls.len(), 2);
        assert!(calls[1].1.is_empty());
    }

    #[test]
    fn failed_enforcement_is_retried_on_next_sweep() {
        let enforcer = RecordingEnforcer::default();
        let calls = enforcer.calls.clone();
        enforcer.set_failing(true);
        let c = controller(enforcer.clone());

        // State transition succeeds even though the port is down.
        let state = c.activate("ada", 10);
        assert!(state.active);
        assert_eq!(c.pending_retries(), 1);
        assert!(calls.lock().unwrap().is_empty());

        enforcer.set_failing(false);
        c.retry_failed();
        assert_eq!(c.pending_retries(), 0);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn deactivate_without_active_state_is_a_noop() {
        let enforcer = RecordingEnforcer::default();
        let calls = enforcer.calls.clone();
        let c = controller(enforcer);
        c.deactivate("ada");
        assert!(calls.lock().unwrap().is_empty());
    }
}
