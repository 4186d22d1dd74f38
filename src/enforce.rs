//! Enforcement adapters.
//!
//! Actual application blocking is an external capability: `CommandEnforcer`
//! shells out to a configured blocker program with the user id and the
//! comma-joined allowed-app list (empty list clears restrictions).
//! `NullEnforcer` is the default when no command is configured.

use std::process::Command;

use anyhow::{Context, Result};
use tracing::debug;

use crate::ports::EnforcementPort;

/// No-op enforcement for setups without a blocker hook.
#[derive(Debug, Default)]
pub struct NullEnforcer;

impl EnforcementPort for NullEnforcer {
    fn set_allowed_apps(&self, user_id: &str, allowed_apps: &[String]) -> Result<()> {
        debug!(user = user_id, apps = ?allowed_apps, "no enforcement hook configured");
        Ok(())
    }

    fn clear(&self, user_id: &str) -> Result<()> {
        debug!(user = user_id, "no enforcement hook configured");
        Ok(())
    }
}

/// Shells out to an external blocker command.
pub struct CommandEnforcer {
    program: String,
}

impl CommandEnforcer {
    pub fn new(program: String) -> Self {
        Self { program }
    }

    fn run(&self, user_id: &str, apps_arg: &str) -> Result<()> {
        let output = Command::new(&self.program)
            .arg(user_id)
            .arg(apps_arg)
            .output()
            .with_context(|| format!("failed to run enforcement command '{}'", self.program))?;
        if !output.status.success() {
            anyhow::bail!(
                "enforcement command '{}' exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

impl EnforcementPort for CommandEnforcer {
    fn set_allowed_apps(&self, user_id: &str, allowed_apps: &[String]) -> Result<()> {
        self.run(user_id, &allowed_apps.join(","))
    }

    fn clear(&self, user_id: &str) -> Result<()> {
        self.run(user_id, "")
    }
}
