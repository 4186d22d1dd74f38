//! Escalation scheduler — the periodic sweep over active sessions.
//!
//! The sweep is responsible for:
//! - reconciling expired bypass grants (authoritative even if the
//!   dedicated timer was missed),
//! - retrying enforcement calls that failed earlier,
//! - recomputing each session's time-based target level and applying it
//!   when it exceeds the current level,
//! - gating hijack activation (the app restriction, not the level itself)
//!   behind explicit confirmation,
//! - turning pushed pattern signals into pending suggestions.
//!
//! Every pass recomputes elapsed time from the session's `start_time`, so
//! duplicate or missed ticks are safe: a stale target is a no-op and a
//! late tick lands on the same level a punctual one would have.

use std::sync::Arc;

use chrono::{DateTime, Local, Timelike, Utc};
use tracing::{debug, info};

use crate::bypass::{BypassManager, BypassReversion};
use crate::catalog::{HIJACK_THRESHOLD, MAX_INSIST_LEVEL, level_info};
use crate::error::{EngineError, EngineResult};
use crate::hijack::HijackController;
use crate::log::{LogEvent, TransitionLog};
use crate::policy::{self, EscalationSchedule, PatternSignal, SideSignal};
use crate::ports::{Notification, NotificationAction, NotifyQueue, Urgency};
use crate::session::{LevelChange, LevelChangeReason, PendingSuggestion, SessionStore};

/// Local-time hours inside which the sweep escalates.
#[derive(Debug, Clone, Copy)]
pub struct EnforcementWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl EnforcementWindow {
    pub fn contains(&self, now: DateTime<Local>) -> bool {
        let hour = now.hour();
        self.start_hour <= hour && hour < self.end_hour
    }
}

/// What one sweep pass did.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Active sessions examined.
    pub sessions: usize,
    /// Time-based escalations applied.
    pub escalated: Vec<LevelChange>,
    /// Bypass grants reverted by this pass.
    pub reverted: Vec<BypassReversion>,
    /// Users prompted (or re-prompted) for hijack confirmation.
    pub hijack_prompts: Vec<String>,
    /// True when the pass ran outside the enforcement window and skipped
    /// escalation (bypass reconcile still ran).
    pub outside_window: bool,
}

/// Result of handling a batch of pattern signals.
#[derive(Debug, Clone)]
pub struct PatternOutcome {
    pub suggestion: Option<PendingSuggestion>,
    pub side_signals: Vec<SideSignal>,
}

pub struct EscalationScheduler {
    sessions: Arc<SessionStore>,
    hijack: Arc<HijackController>,
    bypass: Arc<BypassManager>,
    schedule: EscalationSchedule,
    notify: Arc<NotifyQueue>,
    log: Arc<TransitionLog>,
    window: EnforcementWindow,
}

impl EscalationScheduler {
    pub fn new(
        sessions: Arc<SessionStore>,
        hijack: Arc<HijackController>,
        bypass: Arc<BypassManager>,
        schedule: EscalationSchedule,
        notify: Arc<NotifyQueue>,
        log: Arc<TransitionLog>,
        window: EnforcementWindow,
    ) -> Self {
        Self {
            sessions,
            hijack,
            bypass,
            schedule,
            notify,
            log,
            window,
        }
    }

    pub fn schedule(&self) -> &EscalationSchedule {
        &self.schedule
    }

    /// Revert expired bypass grants and restore hijack state where the
    /// restored level lands back in the Hijack band.
    ///
    /// Called by both the daemon's timer loop and every sweep, so an
    /// elapsed expiry is observed even when one trigger is lost.
    pub fn reconcile(&self, now_utc: DateTime<Utc>) -> EngineResult<Vec<BypassReversion>> {
        let reverted = self.bypass.reconcile(&self.sessions, &self.schedule, now_utc)?;
        for reversion in &reverted {
            self.log.log(LogEvent::BypassReverted {
                user_id: reversion.user_id.clone(),
                restored_level: reversion.restored_level,
            })
            .ok();
            self.notify_level(&reversion.user_id, reversion.restored_level, Urgency::High, vec![]);

            if reversion.restored_level >= HIJACK_THRESHOLD {
                let Some(session) = self.sessions.get(&reversion.user_id) else {
                    continue;
                };
                if session.hijack_confirmed {
                    // Confirmed earlier this session; re-engage directly.
                    let state = self.hijack.activate(&reversion.user_id, reversion.restored_level);
                    self.log.log(LogEvent::HijackActivated {
                        user_id: reversion.user_id.clone(),
                        level: reversion.restored_level,
                        allowed_apps: state.allowed_apps,
                    })
                    .ok();
                } else {
                    self.prompt_hijack(&reversion.user_id, reversion.restored_level)?;
                }
            }
        }
        Ok(reverted)
    }

    /// One sweep pass.
    pub fn sweep(&self, now: DateTime<Local>) -> EngineResult<SweepOutcome> {
        let now_utc = now.with_timezone(&Utc);
        let mut outcome = SweepOutcome::default();

        // Expired bypasses revert regardless of the window.
        outcome.reverted = self.reconcile(now_utc)?;

        self.hijack.retry_failed();

        if !self.window.contains(now) {
            debug!(hour = now.hour(), "outside enforcement window, escalation skipped");
            outcome.outside_window = true;
            return Ok(outcome);
        }

        for user_id in self.sessions.active_users() {
            let Some(session) = self.sessions.get(&user_id) else {
                continue;
            };
            if session.completed {
                continue;
            }
            outcome.sessions += 1;

            // A live bypass holds the level down until reconcile restores it.
            if self.bypass.active_grant(&user_id).is_some() {
                continue;
            }

            let elapsed = session.elapsed_minutes(now_utc);
            let target = self.schedule.target_level_for_elapsed(elapsed);
            if target <= session.current_level && !session.hijack_pending_confirmation {
                continue;
            }

            if target >= HIJACK_THRESHOLD
                && !self.hijack.is_active(&user_id)
                && !session.hijack_confirmed
            {
                if session.hijack_declined {
                    // Declined earlier this session: hold at the Insist cap
                    // and keep asking.
                    let capped = target.min(MAX_INSIST_LEVEL);
                    if capped > session.current_level {
                        let change = self.sessions.apply_level(
                            &user_id,
                            capped,
                            LevelChangeReason::TimeElapsed,
                            now_utc,
                        )?;
                        if change.changed {
                            self.log_level_change(&change, LevelChangeReason::TimeElapsed);
                            outcome.escalated.push(change);
                        }
                    }
                } else {
                    // The level itself is time-driven; only the app
                    // restriction waits for confirmation.
                    let change = self.sessions.apply_level(
                        &user_id,
                        target,
                        LevelChangeReason::TimeElapsed,
                        now_utc,
                    )?;
                    if change.changed {
                        self.log_level_change(&change, LevelChangeReason::TimeElapsed);
                        outcome.escalated.push(change);
                    }
                }
                self.prompt_hijack(&user_id, target)?;
                outcome.hijack_prompts.push(user_id.clone());
                continue;
            }

            let change = self.sessions.apply_level(
                &user_id,
                target,
                LevelChangeReason::TimeElapsed,
                now_utc,
            )?;
            if change.changed {
                self.log_level_change(&change, LevelChangeReason::TimeElapsed);
                if target >= HIJACK_THRESHOLD {
                    // Already confirmed earlier this session; tighten in place.
                    let state = self.hijack.activate(&user_id, target);
                    self.log.log(LogEvent::HijackActivated {
                        user_id: user_id.clone(),
                        level: target,
                        allowed_apps: state.allowed_apps,
                    })
                    .ok();
                }
                let urgency = urgency_for_level(target);
                self.notify_level(&user_id, target, urgency, vec![]);
                outcome.escalated.push(change);
            }
        }

        self.log.log(LogEvent::SweepCompleted {
            sessions: outcome.sessions,
            escalated: outcome.escalated.len(),
            reverted: outcome.reverted.len(),
        })
        .ok();
        Ok(outcome)
    }

    /// Handle pushed pattern signals for a user.
    ///
    /// Adaptive changes are suggestions only: any nonzero net delta is
    /// surfaced with accept/decline actions and waits for the user;
    /// nothing is applied here.
    pub fn handle_patterns(
        &self,
        user_id: &str,
        signals: &[PatternSignal],
        now: DateTime<Utc>,
    ) -> EngineResult<PatternOutcome> {
        let session = self
            .sessions
            .get(user_id)
            .ok_or_else(|| EngineError::SessionNotFound(user_id.to_string()))?;

        let assessment = policy::assess_patterns(signals, session.current_level);

        for side in &assessment.side_signals {
            match side {
                SideSignal::PostHyperfocusSupport => {
                    self.log.log(LogEvent::HyperfocusSupportScheduled {
                        user_id: user_id.to_string(),
                    })
                    .ok();
                    self.notify.push(Notification {
                        user_id: user_id.to_string(),
                        level: session.current_level,
                        message: "hyperfocus noticed — a check-in will follow when it breaks"
                            .to_string(),
                        urgency: Urgency::Low,
                        actions: vec![],
                    });
                }
            }
        }

        if assessment.delta == 0 {
            return Ok(PatternOutcome {
                suggestion: None,
                side_signals: assessment.side_signals,
            });
        }

        let suggested_level = (session.current_level as i16 + assessment.delta as i16) as u8;
        let pending = PendingSuggestion {
            suggested_level,
            delta: assessment.delta,
            raw_delta: assessment.raw_delta,
            reason: summarize_signals(signals),
        };
        self.sessions.update(user_id, |s| {
            s.pending_suggestion = Some(pending.clone());
        })?;

        self.log.log(LogEvent::SuggestionRaised {
            user_id: user_id.to_string(),
            current_level: session.current_level,
            suggested_level,
            delta: assessment.delta,
        })
        .ok();

        let urgency = if assessment.raw_delta.unsigned_abs() >= 2 {
            Urgency::High
        } else {
            Urgency::Normal
        };
        let direction = if assessment.delta > 0 { "raise" } else { "lower" };
        self.notify.push(Notification {
            user_id: user_id.to_string(),
            level: session.current_level,
            message: format!(
                "{} suggests we {direction} enforcement to level {suggested_level}",
                pending.reason
            ),
            urgency,
            actions: vec![
                NotificationAction::new("suggestion:accept", "Accept"),
                NotificationAction::new("suggestion:decline", "Keep current"),
            ],
        });
        info!(
            user = user_id,
            delta = assessment.delta,
            suggested_level,
            "suggestion surfaced"
        );

        Ok(PatternOutcome {
            suggestion: Some(pending),
            side_signals: assessment.side_signals,
        })
    }

    /// Ask (or re-ask) the user to confirm entry into the Hijack band.
    fn prompt_hijack(&self, user_id: &str, target: u8) -> EngineResult<()> {
        self.sessions.update(user_id, |s| {
            s.hijack_pending_confirmation = true;
        })?;
        self.log.log(LogEvent::HijackRequested {
            user_id: user_id.to_string(),
            level: target,
        })
        .ok();
        self.notify.push(Notification {
            user_id: user_id.to_string(),
            level: target,
            message: format!(
                "planning is badly overdue — confirm focus lockdown at level {target}?"
            ),
            urgency: Urgency::Critical,
            actions: vec![
                NotificationAction::new("hijack:confirm", "Confirm"),
                NotificationAction::new("hijack:decline", "Decline"),
            ],
        });
        Ok(())
    }

    fn log_level_change(&self, change: &LevelChange, reason: LevelChangeReason) {
        self.log.log(LogEvent::LevelChanged {
            user_id: change.user_id.clone(),
            from: change.from,
            to: change.to,
            reason: reason.as_str().to_string(),
        })
        .ok();
    }

    fn notify_level(
        &self,
        user_id: &str,
        level: u8,
        urgency: Urgency,
        actions: Vec<NotificationAction>,
    ) {
        let message = level_info(level)
            .map(|info| info.consequence.to_string())
            .unwrap_or_else(|_| format!("enforcement level is now {level}"));
        self.notify.push(Notification {
            user_id: user_id.to_string(),
            level,
            message,
            urgency,
            actions,
        });
    }
}

fn urgency_for_level(level: u8) -> Urgency {
    match level {
        1..=2 => Urgency::Low,
        3..=6 => Urgency::Normal,
        7..=8 => Urgency::High,
        _ => Urgency::Critical,
    }
}

fn summarize_signals(signals: &[PatternSignal]) -> String {
    let mut parts: Vec<String> = signals
        .iter()
        .map(|s| {
            let kind = match s.kind {
                policy::PatternKind::Procrastination => "procrastination",
                policy::PatternKind::Overwhelm => "overwhelm",
                policy::PatternKind::TaskSwitching => "task-switching",
                policy::PatternKind::Hyperfocus => "hyperfocus",
            };
            match s.severity {
                policy::Severity::Severe => format!("severe {kind}"),
                policy::Severity::Moderate => kind.to_string(),
            }
        })
        .collect();
    parts.dedup();
    parts.join(" + ")
}
