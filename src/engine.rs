//! Engine facade — the public API the surrounding app calls.
//!
//! Wires the session store, policy schedule, hijack controller, bypass
//! manager, and the notification/enforcement ports together. Every
//! operation takes an explicit `now` so the daemon, the CLI, and the tests
//! all drive the same deterministic code path.

use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tracing::info;

use crate::bypass::{BypassGrant, BypassManager, BypassReversion};
use crate::catalog::HIJACK_THRESHOLD;
use crate::config::RitualConfig;
use crate::error::{EngineError, EngineResult};
use crate::hijack::{HijackController, HijackState};
use crate::log::{LogEvent, TransitionLog};
use crate::policy::PatternSignal;
use crate::ports::{
    EnforcementPort, Notification, NotificationPort, NotifyQueue, Urgency,
};
use crate::scheduler::{
    EnforcementWindow, EscalationScheduler, PatternOutcome, SweepOutcome,
};
use crate::session::{EnforcementSession, LevelChangeReason, SessionStore};
use crate::store::StateStore;

/// Tunables lifted from config at startup.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub preferred_level: u8,
    pub min_bypass_level: u8,
    pub bypass_minutes: u32,
    pub bypass_reduction: u8,
}

impl From<&RitualConfig> for EngineSettings {
    fn from(config: &RitualConfig) -> Self {
        Self {
            preferred_level: config.defaults.preferred_level,
            min_bypass_level: config.defaults.min_bypass_level,
            bypass_minutes: config.defaults.bypass_minutes,
            bypass_reduction: config.defaults.bypass_reduction,
        }
    }
}

/// Read-only view returned by `status`.
#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub session: EnforcementSession,
    pub hijack: Option<HijackState>,
    pub bypass: Option<BypassGrant>,
}

pub struct Engine {
    sessions: Arc<SessionStore>,
    hijack: Arc<HijackController>,
    bypass: Arc<BypassManager>,
    scheduler: EscalationScheduler,
    notify: Arc<NotifyQueue>,
    log: Arc<TransitionLog>,
    settings: EngineSettings,
}

impl Engine {
    /// Build the engine from config and adapters. Fails fast on a
    /// malformed escalation schedule.
    pub fn new(
        config: &RitualConfig,
        store: Arc<StateStore>,
        log: Arc<TransitionLog>,
        notifier: Box<dyn NotificationPort>,
        enforcer: Arc<dyn EnforcementPort>,
    ) -> EngineResult<Self> {
        let schedule = config.schedule.build()?;
        let sessions = Arc::new(SessionStore::new(Arc::clone(&store))?);
        let bypass = Arc::new(BypassManager::new(Arc::clone(&store))?);
        let hijack = Arc::new(HijackController::new(
            config.hijack.base_apps.clone(),
            config.hijack.level9_apps.clone(),
            enforcer,
        ));
        let notify = Arc::new(NotifyQueue::new(notifier));
        let scheduler = EscalationScheduler::new(
            Arc::clone(&sessions),
            Arc::clone(&hijack),
            Arc::clone(&bypass),
            schedule,
            Arc::clone(&notify),
            Arc::clone(&log),
            EnforcementWindow {
                start_hour: config.window.start_hour,
                end_hour: config.window.end_hour,
            },
        );
        Ok(Self {
            sessions,
            hijack,
            bypass,
            scheduler,
            notify,
            log,
            settings: EngineSettings::from(config),
        })
    }

    /// Open the day's enforcement session. The starting level is
    /// `max(preferred_level, 2)` — planning is already overdue when a
    /// session exists at all.
    pub fn start_session(&self, user_id: &str, now: DateTime<Utc>) -> EngineResult<EnforcementSession> {
        let initial = self.settings.preferred_level.max(2);
        let session = self.sessions.start(user_id, initial, now)?;
        self.log.log(LogEvent::SessionStarted {
            user_id: user_id.to_string(),
            level: initial,
        })
        .ok();
        self.notify.push(Notification {
            user_id: user_id.to_string(),
            level: initial,
            message: "morning plan is still open — a quiet reminder".to_string(),
            urgency: Urgency::Low,
            actions: vec![],
        });
        Ok(session)
    }

    /// The plan was written: tear everything down for the day.
    pub fn complete_session(&self, user_id: &str, now: DateTime<Utc>) -> EngineResult<EnforcementSession> {
        let session = self.sessions.complete(user_id, now)?;
        self.bypass.cancel(user_id)?;
        self.hijack.deactivate(user_id);
        self.log.log(LogEvent::SessionCompleted {
            user_id: user_id.to_string(),
            final_level: session.current_level,
        })
        .ok();
        self.log.log(LogEvent::HijackDeactivated {
            user_id: user_id.to_string(),
        })
        .ok();
        self.notify.push(Notification {
            user_id: user_id.to_string(),
            level: session.current_level,
            message: "plan written — enforcement released for today".to_string(),
            urgency: Urgency::Low,
            actions: vec![],
        });
        info!(user = user_id, "session completed");
        Ok(session)
    }

    /// Request an emergency bypass. Every request counts against the
    /// session, granted or not.
    pub fn request_bypass(
        &self,
        user_id: &str,
        reason: &str,
        duration_minutes: Option<u32>,
        now: DateTime<Utc>,
    ) -> EngineResult<BypassGrant> {
        self.sessions.update(user_id, |s| {
            s.bypass_request_count += 1;
        })?;
        let minutes = duration_minutes.unwrap_or(self.settings.bypass_minutes);
        let grant = self.bypass.grant(
            &self.sessions,
            user_id,
            minutes,
            reason,
            self.settings.min_bypass_level,
            self.settings.bypass_reduction,
            now,
        )?;
        // Restrictions lift for the bypass window.
        self.hijack.deactivate(user_id);
        self.log.log(LogEvent::BypassGranted {
            user_id: user_id.to_string(),
            from: grant.original_level,
            to: grant.temporary_level,
            expires_at: grant.expires_at.to_rfc3339(),
            reason: reason.to_string(),
        })
        .ok();
        self.notify.push(Notification {
            user_id: user_id.to_string(),
            level: grant.temporary_level,
            message: format!(
                "bypass granted until {} — level eased to {}",
                grant.expires_at.format("%H:%M"),
                grant.temporary_level
            ),
            urgency: Urgency::Normal,
            actions: vec![],
        });
        Ok(grant)
    }

    /// Snapshot of the user's enforcement state.
    pub fn status(&self, user_id: &str) -> EngineResult<StatusSnapshot> {
        let session = self
            .sessions
            .get(user_id)
            .ok_or_else(|| EngineError::SessionNotFound(user_id.to_string()))?;
        Ok(StatusSnapshot {
            session,
            hijack: self.hijack.state(user_id),
            bypass: self.bypass.active_grant(user_id),
        })
    }

    /// Inbound pattern signals from the external detector.
    pub fn pattern_event(
        &self,
        user_id: &str,
        signals: &[PatternSignal],
        now: DateTime<Utc>,
    ) -> EngineResult<PatternOutcome> {
        self.scheduler.handle_patterns(user_id, signals, now)
    }

    /// Accept the pending adaptive suggestion.
    pub fn accept_suggestion(&self, user_id: &str, now: DateTime<Utc>) -> EngineResult<EnforcementSession> {
        let pending = self
            .sessions
            .take_pending_suggestion(user_id)?
            .ok_or_else(|| EngineError::NoPendingSuggestion(user_id.to_string()))?;

        let change = self.sessions.apply_level(
            user_id,
            pending.suggested_level,
            LevelChangeReason::SuggestionAccepted,
            now,
        )?;
        if change.changed {
            self.log.log(LogEvent::LevelChanged {
                user_id: user_id.to_string(),
                from: change.from,
                to: change.to,
                reason: LevelChangeReason::SuggestionAccepted.as_str().to_string(),
            })
            .ok();
        }
        self.log.log(LogEvent::SuggestionAccepted {
            user_id: user_id.to_string(),
            level: pending.suggested_level,
        })
        .ok();

        if pending.suggested_level >= HIJACK_THRESHOLD {
            // Accepting a suggestion into the Hijack band is the explicit
            // confirmation.
            let session = self.sessions.update(user_id, |s| {
                s.hijack_confirmed = true;
                s.hijack_pending_confirmation = false;
                s.hijack_declined = false;
            })?;
            let state = self.hijack.activate(user_id, pending.suggested_level);
            self.log.log(LogEvent::HijackActivated {
                user_id: user_id.to_string(),
                level: pending.suggested_level,
                allowed_apps: state.allowed_apps,
            })
            .ok();
            return Ok(session);
        }
        if change.to < HIJACK_THRESHOLD && self.hijack.is_active(user_id) {
            // An accepted reduction drops the session out of hijack.
            self.hijack.deactivate(user_id);
            self.log.log(LogEvent::HijackDeactivated {
                user_id: user_id.to_string(),
            })
            .ok();
        }
        self.sessions
            .get(user_id)
            .ok_or_else(|| EngineError::SessionNotFound(user_id.to_string()))
    }

    /// Decline the pending adaptive suggestion; the level stays put.
    pub fn decline_suggestion(&self, user_id: &str) -> EngineResult<()> {
        let pending = self.sessions.take_pending_suggestion(user_id)?;
        if pending.is_none() {
            return Err(EngineError::NoPendingSuggestion(user_id.to_string()));
        }
        self.log.log(LogEvent::SuggestionDeclined {
            user_id: user_id.to_string(),
        })
        .ok();
        Ok(())
    }

    /// Answer a pending hijack confirmation.
    ///
    /// The level itself is already time-driven; accepting engages the
    /// controller at the schedule's target (at least level 9). Declining
    /// falls back to level 8, and the typed error tells the caller the
    /// sweep will re-prompt.
    pub fn answer_hijack(
        &self,
        user_id: &str,
        accepted: bool,
        now: DateTime<Utc>,
    ) -> EngineResult<EnforcementSession> {
        let session = self
            .sessions
            .get(user_id)
            .ok_or_else(|| EngineError::SessionNotFound(user_id.to_string()))?;
        if !session.hijack_pending_confirmation {
            return Err(EngineError::NoPendingHijack(user_id.to_string()));
        }

        if !accepted {
            self.sessions.update(user_id, |s| {
                s.hijack_pending_confirmation = false;
                s.hijack_declined = true;
            })?;
            self.sessions.apply_level(
                user_id,
                crate::catalog::MAX_INSIST_LEVEL,
                LevelChangeReason::HijackDeclined,
                now,
            )?;
            self.log.log(LogEvent::HijackDeclined {
                user_id: user_id.to_string(),
            })
            .ok();
            return Err(EngineError::HijackConfirmationDeclined(user_id.to_string()));
        }

        let elapsed = session.elapsed_minutes(now);
        let target = self
            .scheduler
            .schedule()
            .target_level_for_elapsed(elapsed)
            .max(HIJACK_THRESHOLD);
        self.sessions.update(user_id, |s| {
            s.hijack_pending_confirmation = false;
            s.hijack_confirmed = true;
            s.hijack_declined = false;
        })?;
        let change =
            self.sessions
                .apply_level(user_id, target, LevelChangeReason::TimeElapsed, now)?;
        if change.changed {
            self.log.log(LogEvent::LevelChanged {
                user_id: user_id.to_string(),
                from: change.from,
                to: change.to,
                reason: LevelChangeReason::TimeElapsed.as_str().to_string(),
            })
            .ok();
        }
        let state = self.hijack.activate(user_id, target);
        self.log.log(LogEvent::HijackActivated {
            user_id: user_id.to_string(),
            level: target,
            allowed_apps: state.allowed_apps,
        })
        .ok();
        self.notify.push(Notification {
            user_id: user_id.to_string(),
            level: target,
            message: "focus lockdown engaged — planning tools only".to_string(),
            urgency: Urgency::Critical,
            actions: vec![],
        });
        self.sessions
            .get(user_id)
            .ok_or_else(|| EngineError::SessionNotFound(user_id.to_string()))
    }

    /// Record an attempt to leave the allowed set during hijack.
    pub fn record_escape_attempt(&self, user_id: &str) -> EngineResult<u32> {
        let count = self
            .hijack
            .record_escape_attempt(user_id)
            .ok_or_else(|| EngineError::HijackNotActive(user_id.to_string()))?;
        self.log.log(LogEvent::EscapeAttempt {
            user_id: user_id.to_string(),
            count,
        })
        .ok();
        Ok(count)
    }

    /// One sweep pass (window-gated escalation plus reconcile).
    pub fn sweep(&self, now: DateTime<Local>) -> EngineResult<SweepOutcome> {
        self.scheduler.sweep(now)
    }

    /// Bypass expiry check, driven by the daemon's timer between sweeps.
    pub fn reconcile(&self, now: DateTime<Utc>) -> EngineResult<Vec<BypassReversion>> {
        self.scheduler.reconcile(now)
    }

    /// Clear all sessions and grants at the calendar-day boundary.
    pub fn daily_reset(&self) -> EngineResult<usize> {
        for user_id in self.sessions.active_users() {
            self.hijack.deactivate(&user_id);
        }
        self.bypass.reset();
        let cleared = self.sessions.daily_reset()?;
        self.log.log(LogEvent::DailyReset { cleared }).ok();
        info!(cleared, "daily reset");
        Ok(cleared)
    }
}
