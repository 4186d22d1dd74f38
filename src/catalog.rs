//! The level catalog — static descriptors for the ten-level spectrum.
//!
//! Pure data: names, bands, notification cadence, dismissibility, and the
//! consequence text surfaced to the user. The catalog never changes at
//! runtime; behavior lives in the policy and scheduler modules.

use serde::Serialize;

use crate::error::{EngineError, EngineResult};

/// Lowest and highest spectrum levels.
pub const MIN_LEVEL: u8 = 1;
pub const MAX_LEVEL: u8 = 10;

/// First level of the Hijack band. Transitions at or above this level
/// restrict the allowed application set.
pub const HIJACK_THRESHOLD: u8 = 9;

/// Highest level of the Insist band — the fallback when hijack activation
/// is declined.
pub const MAX_INSIST_LEVEL: u8 = 8;

/// Named group of adjacent levels sharing a behavioral character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    Whisper,
    Nudge,
    Prompt,
    Insist,
    Hijack,
}

impl Band {
    /// Band for a given level. Levels outside 1..=10 are the caller's bug.
    pub fn for_level(level: u8) -> Band {
        match level {
            1 | 2 => Band::Whisper,
            3 | 4 => Band::Nudge,
            5 | 6 => Band::Prompt,
            7 | 8 => Band::Insist,
            _ => Band::Hijack,
        }
    }
}

impl std::fmt::Display for Band {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Band::Whisper => "whisper",
            Band::Nudge => "nudge",
            Band::Prompt => "prompt",
            Band::Insist => "insist",
            Band::Hijack => "hijack",
        };
        write!(f, "{label}")
    }
}

/// How a notification at this level can be dismissed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dismissibility {
    /// One tap dismisses.
    Free,
    /// Dismissible only after a short hold delay.
    WithDelay,
    /// Dismissal requires a typed justification.
    RequiresJustification,
}

/// Immutable catalog entry for one spectrum level.
#[derive(Debug, Clone, Serialize)]
pub struct SpectrumLevel {
    pub level: u8,
    pub name: &'static str,
    pub band: Band,
    /// Minutes between repeat notifications while the session sits at this
    /// level. Cadence tightens as levels rise.
    pub cadence_minutes: u32,
    pub dismissibility: Dismissibility,
    pub consequence: &'static str,
}

static LEVELS: [SpectrumLevel; 10] = [
    SpectrumLevel {
        level: 1,
        name: "gentle-cue",
        band: Band::Whisper,
        cadence_minutes: 60,
        dismissibility: Dismissibility::Free,
        consequence: "a single quiet reminder, easily dismissed",
    },
    SpectrumLevel {
        level: 2,
        name: "soft-reminder",
        band: Band::Whisper,
        cadence_minutes: 45,
        dismissibility: Dismissibility::Free,
        consequence: "quiet reminders repeat until the plan is written",
    },
    SpectrumLevel {
        level: 3,
        name: "visible-nudge",
        band: Band::Nudge,
        cadence_minutes: 30,
        dismissibility: Dismissibility::Free,
        consequence: "reminders become visible banners",
    },
    SpectrumLevel {
        level: 4,
        name: "firm-nudge",
        band: Band::Nudge,
        cadence_minutes: 20,
        dismissibility: Dismissibility::WithDelay,
        consequence: "banners require a hold to dismiss",
    },
    SpectrumLevel {
        level: 5,
        name: "direct-prompt",
        band: Band::Prompt,
        cadence_minutes: 15,
        dismissibility: Dismissibility::WithDelay,
        consequence: "prompts interrupt and ask for a start time",
    },
    SpectrumLevel {
        level: 6,
        name: "insistent-prompt",
        band: Band::Prompt,
        cadence_minutes: 10,
        dismissibility: Dismissibility::WithDelay,
        consequence: "prompts recur every few minutes",
    },
    SpectrumLevel {
        level: 7,
        name: "persistent-insist",
        band: Band::Insist,
        cadence_minutes: 7,
        dismissibility: Dismissibility::RequiresJustification,
        consequence: "dismissal requires a written justification",
    },
    SpectrumLevel {
        level: 8,
        name: "maximum-insist",
        band: Band::Insist,
        cadence_minutes: 5,
        dismissibility: Dismissibility::RequiresJustification,
        consequence: "near-continuous prompting; justification required",
    },
    SpectrumLevel {
        level: 9,
        name: "guided-hijack",
        band: Band::Hijack,
        cadence_minutes: 3,
        dismissibility: Dismissibility::RequiresJustification,
        consequence: "applications restricted to planning tools plus support apps",
    },
    SpectrumLevel {
        level: 10,
        name: "full-hijack",
        band: Band::Hijack,
        cadence_minutes: 2,
        dismissibility: Dismissibility::RequiresJustification,
        consequence: "applications restricted to the minimal planning set",
    },
];

/// Look up the catalog entry for a level.
pub fn level_info(level: u8) -> EngineResult<&'static SpectrumLevel> {
    if !(MIN_LEVEL..=MAX_LEVEL).contains(&level) {
        return Err(EngineError::InvalidLevel(level));
    }
    Ok(&LEVELS[(level - 1) as usize])
}

/// All ten levels in ascending order.
pub fn all_levels() -> &'static [SpectrumLevel] {
    &LEVELS
}
