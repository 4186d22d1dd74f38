//! Escalation policy — pure functions over typed inputs.
//!
//! Two independent inputs feed the engine: the deterministic time schedule
//! (elapsed minutes → target level) and heuristic pattern signals
//! (detected behavior → suggested level delta). Both are pure: same inputs,
//! same outputs, so the scheduler can re-evaluate them on every sweep
//! without tracking what it already applied.

use serde::{Deserialize, Serialize};

use crate::catalog::{MAX_LEVEL, MIN_LEVEL};
use crate::error::{EngineError, EngineResult};

/// Default time-to-level schedule: the highest threshold not exceeding the
/// elapsed minutes wins.
pub const DEFAULT_SCHEDULE: [(u32, u8); 7] =
    [(0, 1), (15, 2), (30, 3), (60, 5), (90, 7), (120, 8), (180, 10)];

/// Ordered `(threshold_minutes, level)` table driving time-based escalation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationSchedule {
    thresholds: Vec<(u32, u8)>,
}

impl Default for EscalationSchedule {
    fn default() -> Self {
        Self {
            thresholds: DEFAULT_SCHEDULE.to_vec(),
        }
    }
}

impl EscalationSchedule {
    /// Build a schedule from explicit threshold pairs, validating the table.
    ///
    /// The table is static configuration; a malformed table is a startup
    /// error, never tolerated at runtime.
    pub fn new(thresholds: Vec<(u32, u8)>) -> EngineResult<Self> {
        if thresholds.is_empty() {
            return Err(EngineError::InvalidSchedule("empty threshold table".into()));
        }
        if thresholds[0].0 != 0 {
            return Err(EngineError::InvalidSchedule(format!(
                "first threshold must be 0 minutes, got {}",
                thresholds[0].0
            )));
        }
        for pair in thresholds.windows(2) {
            if pair[1].0 <= pair[0].0 {
                return Err(EngineError::InvalidSchedule(format!(
                    "thresholds must be strictly increasing: {} then {}",
                    pair[0].0, pair[1].0
                )));
            }
            if pair[1].1 <= pair[0].1 {
                return Err(EngineError::InvalidSchedule(format!(
                    "levels must be strictly increasing: {} then {}",
                    pair[0].1, pair[1].1
                )));
            }
        }
        for &(minutes, level) in &thresholds {
            if !(MIN_LEVEL..=MAX_LEVEL).contains(&level) {
                return Err(EngineError::InvalidSchedule(format!(
                    "level {level} at {minutes}m is outside 1..=10"
                )));
            }
        }
        Ok(Self { thresholds })
    }

    /// Deterministic target level for a session that has been open for
    /// `elapsed_minutes`. The highest threshold ≤ elapsed wins.
    pub fn target_level_for_elapsed(&self, elapsed_minutes: u32) -> u8 {
        let mut level = self.thresholds[0].1;
        for &(threshold, target) in &self.thresholds {
            if threshold <= elapsed_minutes {
                level = target;
            } else {
                break;
            }
        }
        level
    }

    pub fn thresholds(&self) -> &[(u32, u8)] {
        &self.thresholds
    }
}

/// Behavioral pattern kinds recognized by the adaptive path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternKind {
    Procrastination,
    Overwhelm,
    TaskSwitching,
    Hyperfocus,
}

/// Detected severity / likelihood of a pattern.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    #[default]
    Moderate,
    Severe,
}

/// One behavioral pattern observation pushed by the external detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSignal {
    pub kind: PatternKind,
    #[serde(default)]
    pub severity: Severity,
    /// How long the pattern has been observed, if the detector knows.
    #[serde(default)]
    pub duration_minutes: Option<u32>,
}

/// Non-numeric side effects a pattern assessment can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SideSignal {
    /// Hyperfocus detected: schedule a supportive check-in for when the
    /// focus block ends, instead of interrupting it.
    PostHyperfocusSupport,
}

/// Result of assessing a batch of pattern signals against a current level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternAssessment {
    /// Net suggested delta, already clamped so `current + delta` stays
    /// within 1..=10. Zero means no level change is suggested.
    pub delta: i8,
    /// Raw summed delta before clamping (for urgency decisions and logs).
    pub raw_delta: i8,
    pub side_signals: Vec<SideSignal>,
}

fn signal_delta(signal: &PatternSignal) -> i8 {
    match signal.kind {
        PatternKind::Procrastination => match signal.severity {
            Severity::Severe => 2,
            Severity::Moderate => 1,
        },
        PatternKind::Overwhelm => -1,
        PatternKind::TaskSwitching => 1,
        PatternKind::Hyperfocus => 0,
    }
}

/// Combine pattern signals into a single suggested delta.
///
/// Deltas sum across signals, then the result is clamped so the final
/// suggested level stays within 1..=10. Hyperfocus contributes no delta but
/// emits a [`SideSignal::PostHyperfocusSupport`].
pub fn assess_patterns(signals: &[PatternSignal], current_level: u8) -> PatternAssessment {
    // Sum wide: a large batch saturates instead of overflowing.
    let raw: i32 = signals.iter().map(|s| signal_delta(s) as i32).sum();
    let mut side_signals = Vec::new();
    if signals.iter().any(|s| s.kind == PatternKind::Hyperfocus) {
        side_signals.push(SideSignal::PostHyperfocusSupport);
    }

    let target = (current_level as i32 + raw).clamp(MIN_LEVEL as i32, MAX_LEVEL as i32);
    let delta = (target - current_level as i32) as i8;
    let raw_delta = raw.clamp(i8::MIN as i32, i8::MAX as i32) as i8;

    PatternAssessment {
        delta,
        raw_delta,
        side_signals,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn signal(kind: PatternKind, severity: Severity) -> PatternSignal {
        PatternSignal {
            kind,
            severity,
            duration_minutes: None,
        }
    }

    #[test]
    fn default_schedule_matches_canonical_table() {
        let schedule = EscalationSchedule::default();
        assert_eq!(schedule.target_level_for_elapsed(0), 1);
        assert_eq!(schedule.target_level_for_elapsed(14), 1);
        assert_eq!(schedule.target_level_for_elapsed(15), 2);
        assert_eq!(schedule.target_level_for_elapsed(31), 3);
        assert_eq!(schedule.target_level_for_elapsed(61), 5);
        assert_eq!(schedule.target_level_for_elapsed(90), 7);
        assert_eq!(schedule.target_level_for_elapsed(120), 8);
        assert_eq!(schedule.target_level_for_elapsed(179), 8);
        assert_eq!(schedule.target_level_for_elapsed(185), 10);
        assert_eq!(schedule.target_level_for_elapsed(10_000), 10);
    }

    #[test]
    fn schedule_rejects_non_increasing_thresholds() {
        let err = EscalationSchedule::new(vec![(0, 1), (30, 3), (30, 5)]).unwrap_err();
        assert!(err.to_string().contains("strictly increasing"));

        let err = EscalationSchedule::new(vec![(0, 3), (30, 2)]).unwrap_err();
        assert!(err.to_string().contains("strictly increasing"));
    }

    #[test]
    fn schedule_rejects_empty_and_missing_zero() {
        assert!(EscalationSchedule::new(vec![]).is_err());
        assert!(EscalationSchedule::new(vec![(5, 1), (30, 3)]).is_err());
    }

    #[test]
    fn schedule_rejects_out_of_range_levels() {
        let err = EscalationSchedule::new(vec![(0, 1), (30, 11)]).unwrap_err();
        assert!(matches!(err, crate::error::EngineError::InvalidSchedule(_)));
    }

    #[test]
    fn severe_procrastination_suggests_plus_two() {
        let assessment = assess_patterns(
            &[signal(PatternKind::Procrastination, Severity::Severe)],
            4,
        );
        assert_eq!(assessment.delta, 2);
        assert!(assessment.side_signals.is_empty());
    }

    #[test]
    fn overwhelm_suggests_minus_one() {
        let assessment = assess_patterns(&[signal(PatternKind::Overwhelm, Severity::Moderate)], 6);
        assert_eq!(assessment.delta, -1);
    }

    #[test]
    fn signals_sum_before_clamping() {
        // severe procrastination (+2) + task switching (+1) + overwhelm (-1) = +2
        let assessment = assess_patterns(
            &[
                signal(PatternKind::Procrastination, Severity::Severe),
                signal(PatternKind::TaskSwitching, Severity::Moderate),
                signal(PatternKind::Overwhelm, Severity::Moderate),
            ],
            5,
        );
        assert_eq!(assessment.raw_delta, 2);
        assert_eq!(assessment.delta, 2);
    }

    #[test]
    fn delta_clamps_at_spectrum_bounds() {
        let up = assess_patterns(
            &[
                signal(PatternKind::Procrastination, Severity::Severe),
                signal(PatternKind::TaskSwitching, Severity::Moderate),
            ],
            9,
        );
        assert_eq!(up.raw_delta, 3);
        assert_eq!(up.delta, 1, "suggested level must not exceed 10");

        let down = assess_patterns(&[signal(PatternKind::Overwhelm, Severity::Moderate)], 1);
        assert_eq!(down.delta, 0, "suggested level must not drop below 1");
    }

    #[test]
    fn large_signal_batches_saturate_instead_of_overflowing() {
        let signals: Vec<PatternSignal> = (0..70)
            .map(|_| signal(PatternKind::Procrastination, Severity::Severe))
            .collect();
        let assessment = assess_patterns(&signals, 4);
        assert_eq!(assessment.delta, 6, "clamped to the top of the spectrum");
        assert_eq!(assessment.raw_delta, i8::MAX);
    }

    #[test]
    fn hyperfocus_emits_side_signal_without_delta() {
        let assessment = assess_patterns(&[signal(PatternKind::Hyperfocus, Severity::Severe)], 5);
        assert_eq!(assessment.delta, 0);
        assert_eq!(
            assessment.side_signals,
            vec![SideSignal::PostHyperfocusSupport]
        );
    }

    proptest! {
        #[test]
        fn target_level_is_monotone_in_elapsed(a in 0u32..1_000, b in 0u32..1_000) {
            let schedule = EscalationSchedule::default();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(
                schedule.target_level_for_elapsed(lo) <= schedule.target_level_for_elapsed(hi)
            );
        }

        #[test]
        fn suggested_level_stays_in_bounds(current in 1u8..=10, n in 0usize..6) {
            let pool = [
                PatternKind::Procrastination,
                PatternKind::Overwhelm,
                PatternKind::TaskSwitching,
                PatternKind::Hyperfocus,
            ];
            let signals: Vec<PatternSignal> = (0..n)
                .map(|i| PatternSignal {
                    kind: pool[i % pool.len()],
                    severity: if i % 2 == 0 { Severity::Severe } else { Severity::Moderate },
                    duration_minutes: None,
                })
                .collect();
            let assessment = assess_patterns(&signals, current);
            let target = current as i16 + assessment.delta as i16;
            prop_assert!((1..=10).contains(&target));
        }
    }
}
