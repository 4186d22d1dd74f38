//! Long-running enforcement loop behind `ritual run`.
//!
//! Three timers share one thread:
//! - a cron schedule fires the escalation sweep inside the enforcement
//!   window (every `sweep_interval_minutes`),
//! - a once-a-minute reconcile catches bypass expiries between sweeps,
//! - a local-date change triggers the daily reset.
//!
//! Ctrl-C flips a stop flag; the loop drains within one poll interval.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Datelike, Local, NaiveDate, Utc};
use cron::Schedule;
use tracing::{info, warn};

use crate::config::WindowConfig;
use crate::engine::Engine;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const RECONCILE_EVERY_SECS: i64 = 60;

/// Cron expression for the sweep: every N minutes inside the window hours.
fn sweep_cron_expr(window: &WindowConfig) -> Result<String> {
    if window.start_hour >= window.end_hour || window.end_hour > 24 {
        bail!(
            "invalid enforcement window {}..{} (expected start < end <= 24)",
            window.start_hour,
            window.end_hour
        );
    }
    if window.sweep_interval_minutes == 0 || window.sweep_interval_minutes > 59 {
        bail!(
            "invalid sweep interval {} minutes (expected 1..=59)",
            window.sweep_interval_minutes
        );
    }
    // sec min hour day month weekday
    Ok(format!(
        "0 0/{} {}-{} * * *",
        window.sweep_interval_minutes,
        window.start_hour,
        window.end_hour - 1
    ))
}

/// Run the enforcement loop until Ctrl-C.
pub fn run(engine: &Engine, window: &WindowConfig) -> Result<()> {
    let expr = sweep_cron_expr(window)?;
    let schedule = Schedule::from_str(&expr)
        .with_context(|| format!("failed to parse sweep schedule '{expr}'"))?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = stop.clone();
    ctrlc::set_handler(move || {
        stop_clone.store(true, Ordering::Relaxed);
    })
    .ok();

    let mut now = Local::now();
    let mut next_sweep = next_after(&schedule, now);
    let mut next_reconcile = now.with_timezone(&Utc);
    let mut today = now.date_naive();

    info!(
        schedule = %expr,
        first_sweep = %next_sweep,
        "enforcement loop started"
    );

    // Catch up immediately: a restart mid-morning must not wait for the
    // next cron instant to re-apply overdue escalation.
    sweep_once(engine, now);

    while !stop.load(Ordering::Relaxed) {
        thread::sleep(POLL_INTERVAL);
        now = Local::now();

        let date = now.date_naive();
        if date != today {
            reset_once(engine, today, date);
            today = date;
            next_sweep = next_after(&schedule, now);
        }

        let now_utc = now.with_timezone(&Utc);
        if now_utc >= next_reconcile {
            if let Err(err) = engine.reconcile(now_utc) {
                warn!(error = %err, "reconcile failed");
            }
            next_reconcile = now_utc + chrono::Duration::seconds(RECONCILE_EVERY_SECS);
        }

        if now >= next_sweep {
            sweep_once(engine, now);
            next_sweep = next_after(&schedule, now);
        }
    }

    info!("enforcement loop stopped");
    Ok(())
}

fn next_after(schedule: &Schedule, now: DateTime<Local>) -> DateTime<Local> {
    schedule
        .after(&now)
        .next()
        // An hour-of-day schedule always has a next instant; fall back to
        // one minute out rather than spinning.
        .unwrap_or(now + chrono::Duration::minutes(1))
}

fn sweep_once(engine: &Engine, now: DateTime<Local>) {
    match engine.sweep(now) {
        Ok(outcome) if outcome.outside_window => {
            info!(reverted = outcome.reverted.len(), "sweep outside window");
        }
        Ok(outcome) => {
            info!(
                sessions = outcome.sessions,
                escalated = outcome.escalated.len(),
                reverted = outcome.reverted.len(),
                prompts = outcome.hijack_prompts.len(),
                "sweep completed"
            );
        }
        Err(err) => warn!(error = %err, "sweep failed"),
    }
}

fn reset_once(engine: &Engine, from: NaiveDate, to: NaiveDate) {
    info!(
        from = %from,
        to = %to,
        day = to.weekday().to_string(),
        "calendar day changed"
    );
    match engine.daily_reset() {
        Ok(cleared) => info!(cleared, "daily reset applied"),
        Err(err) => warn!(error = %err, "daily reset failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cron_expr_covers_the_window() {
        let window = WindowConfig {
            start_hour: 6,
            end_hour: 12,
            sweep_interval_minutes: 15,
        };
        assert_eq!(sweep_cron_expr(&window).unwrap(), "0 0/15 6-11 * * *");
    }

    #[test]
    fn cron_expr_parses_and_stays_inside_window() {
        use chrono::TimeZone;

        let window = WindowConfig {
            start_hour: 6,
            end_hour: 12,
            sweep_interval_minutes: 15,
        };
        let schedule = Schedule::from_str(&sweep_cron_expr(&window).unwrap()).unwrap();

        let evening = Local.with_ymd_and_hms(2026, 3, 2, 13, 0, 0).unwrap();
        let next = next_after(&schedule, evening);
        // Next instant is tomorrow at the window open.
        assert_eq!(next.date_naive(), evening.date_naive().succ_opt().unwrap());
        assert_eq!(next.format("%H:%M:%S").to_string(), "06:00:00");

        let morning = Local.with_ymd_and_hms(2026, 3, 2, 7, 1, 0).unwrap();
        let next = next_after(&schedule, morning);
        assert_eq!(next.format("%H:%M:%S").to_string(), "07:15:00");
    }

    #[test]
    fn degenerate_windows_are_rejected() {
        let window = WindowConfig {
            start_hour: 12,
            end_hour: 6,
            sweep_interval_minutes: 15,
        };
        assert!(sweep_cron_expr(&window).is_err());

        let window = WindowConfig {
            start_hour: 6,
            end_hour: 12,
            sweep_interval_minutes: 0,
        };
        assert!(sweep_cron_expr(&window).is_err());
    }
}
