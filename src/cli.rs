use clap::{Parser, Subcommand, ValueEnum};

use crate::policy::{PatternKind, Severity};

#[derive(Parser, Debug)]
#[command(
    name = "ritual",
    about = "Escalating enforcement for a daily morning planning ritual",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Act for this user instead of the configured default
    #[arg(short, long, global = true)]
    pub user: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Open today's enforcement session (planning is now overdue)
    Start,

    /// Mark the morning plan written and release all enforcement
    Complete,

    /// Show the current session, hijack, and bypass state
    Status {
        /// Emit machine-readable JSON instead of the human summary
        #[arg(long)]
        json: bool,
    },

    /// Request a temporary emergency bypass
    Bypass {
        /// Why the bypass is needed (recorded in the audit log)
        #[arg(long)]
        reason: String,

        /// How long the bypass should last, in minutes
        #[arg(long)]
        minutes: Option<u32>,
    },

    /// Report an observed behavioral pattern
    Pattern {
        /// What was observed
        kind: PatternKindArg,

        /// How pronounced the pattern is
        #[arg(long, default_value = "moderate")]
        severity: SeverityArg,

        /// How long the pattern has been going on, in minutes
        #[arg(long)]
        duration: Option<u32>,
    },

    /// Answer a pending level suggestion
    Suggestion {
        #[command(subcommand)]
        answer: Answer,
    },

    /// Answer a pending hijack-mode confirmation
    Hijack {
        #[command(subcommand)]
        answer: HijackAnswer,
    },

    /// Record an attempt to leave the allowed apps during hijack
    Escape,

    /// Run the enforcement loop in the foreground
    Run,

    /// Show the effective configuration
    Config {
        /// Emit machine-readable JSON instead of the human summary
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum Answer {
    /// Apply the suggested level
    Accept,
    /// Keep the current level
    Decline,
}

#[derive(Subcommand, Debug)]
pub enum HijackAnswer {
    /// Engage hijack mode at the overdue target level
    Confirm,
    /// Stay at level 8; the next sweep will ask again
    Decline,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum PatternKindArg {
    Procrastination,
    Overwhelm,
    TaskSwitching,
    Hyperfocus,
}

impl From<PatternKindArg> for PatternKind {
    fn from(arg: PatternKindArg) -> Self {
        match arg {
            PatternKindArg::Procrastination => PatternKind::Procrastination,
            PatternKindArg::Overwhelm => PatternKind::Overwhelm,
            PatternKindArg::TaskSwitching => PatternKind::TaskSwitching,
            PatternKindArg::Hyperfocus => PatternKind::Hyperfocus,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum SeverityArg {
    Moderate,
    Severe,
}

impl From<SeverityArg> for Severity {
    fn from(arg: SeverityArg) -> Self {
        match arg {
            SeverityArg::Moderate => Severity::Moderate,
            SeverityArg::Severe => Severity::Severe,
        }
    }
}
