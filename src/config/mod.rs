use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::EngineResult;
use crate::policy::EscalationSchedule;

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".ritual";

#[derive(Debug, Clone, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_user")]
    pub user: String,
    /// Baseline level a session starts from when planning is overdue. The
    /// effective starting level is `max(preferred_level, 2)`.
    #[serde(default = "default_preferred_level")]
    pub preferred_level: u8,
    /// Lowest current level at which an emergency bypass may be requested.
    #[serde(default = "default_min_bypass_level")]
    pub min_bypass_level: u8,
    /// How long a granted bypass lasts.
    #[serde(default = "default_bypass_minutes")]
    pub bypass_minutes: u32,
    /// How many levels a bypass drops (floored at level 1).
    #[serde(default = "default_bypass_reduction")]
    pub bypass_reduction: u8,
}

fn default_user() -> String {
    "me".to_string()
}

fn default_preferred_level() -> u8 {
    2
}

fn default_min_bypass_level() -> u8 {
    8
}

fn default_bypass_minutes() -> u32 {
    30
}

fn default_bypass_reduction() -> u8 {
    3
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            user: default_user(),
            preferred_level: default_preferred_level(),
            min_bypass_level: default_min_bypass_level(),
            bypass_minutes: default_bypass_minutes(),
            bypass_reduction: default_bypass_reduction(),
        }
    }
}

/// Enforcement window and sweep cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    /// Local hour (0–23) the enforcement window opens.
    #[serde(default = "default_start_hour")]
    pub start_hour: u32,
    /// Local hour the window closes (exclusive).
    #[serde(default = "default_end_hour")]
    pub end_hour: u32,
    #[serde(default = "default_sweep_interval_minutes")]
    pub sweep_interval_minutes: u32,
}

fn default_start_hour() -> u32 {
    6
}

fn default_end_hour() -> u32 {
    12
}

fn default_sweep_interval_minutes() -> u32 {
    15
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            start_hour: default_start_hour(),
            end_hour: default_end_hour(),
            sweep_interval_minutes: default_sweep_interval_minutes(),
        }
    }
}

/// Time-to-level escalation table.
///
/// ```toml
/// [schedule]
/// thresholds = [[0, 1], [15, 2], [30, 3], [60, 5], [90, 7], [120, 8], [180, 10]]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub thresholds: Option<Vec<(u32, u8)>>,
}

impl ScheduleConfig {
    /// Build the validated escalation schedule. A malformed table is fatal.
    pub fn build(&self) -> EngineResult<EscalationSchedule> {
        match &self.thresholds {
            Some(pairs) => EscalationSchedule::new(pairs.clone()),
            None => Ok(EscalationSchedule::default()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HijackConfig {
    /// Applications always allowed in hijack mode.
    #[serde(default = "default_base_apps")]
    pub base_apps: Vec<String>,
    /// Extra applications allowed at level 9 only.
    #[serde(default = "default_level9_apps")]
    pub level9_apps: Vec<String>,
}

fn default_base_apps() -> Vec<String> {
    vec![
        "planner".to_string(),
        "notes".to_string(),
        "calendar".to_string(),
    ]
}

fn default_level9_apps() -> Vec<String> {
    vec!["timer".to_string(), "music-player".to_string()]
}

impl Default for HijackConfig {
    fn default() -> Self {
        Self {
            base_apps: default_base_apps(),
            level9_apps: default_level9_apps(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum NotifyMode {
    #[default]
    Log,
    Telegram,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub mode: NotifyMode,
    #[serde(default)]
    pub telegram_token: Option<String>,
    #[serde(default)]
    pub telegram_chat_id: Option<String>,
}

/// External enforcement hook. The command receives the user id and the
/// comma-joined allowed-app list as arguments; an empty list clears
/// restrictions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnforceConfig {
    #[serde(default)]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RitualConfig {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub hijack: HijackConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub enforce: EnforceConfig,
}

impl RitualConfig {
    /// Search upward from `start` for a `.ritual/config.toml` file and load
    /// it. Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: RitualConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((RitualConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}
