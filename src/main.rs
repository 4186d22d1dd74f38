mod bypass;
mod catalog;
mod cli;
mod config;
mod daemon;
mod enforce;
mod engine;
mod error;
mod hijack;
mod log;
mod notify;
mod paths;
mod policy;
mod ports;
mod scheduler;
mod session;
mod store;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use clap::Parser;
use tracing::info;

use cli::{Answer, Cli, Command, HijackAnswer};
use config::{NotifyMode, RitualConfig};
use engine::{Engine, StatusSnapshot};
use error::EngineError;
use policy::PatternSignal;
use ports::{EnforcementPort, NotificationPort};

fn build_notifier(config: &RitualConfig) -> Result<Box<dyn NotificationPort>> {
    match config.notify.mode {
        NotifyMode::Log => Ok(Box::new(notify::LogNotifier)),
        NotifyMode::Telegram => {
            let token = config
                .notify
                .telegram_token
                .clone()
                .context("notify.mode = \"telegram\" requires notify.telegram_token")?;
            let chat_id = config
                .notify
                .telegram_chat_id
                .clone()
                .context("notify.mode = \"telegram\" requires notify.telegram_chat_id")?;
            Ok(Box::new(notify::TelegramNotifier::new(token, chat_id)))
        }
    }
}

fn build_enforcer(config: &RitualConfig) -> Arc<dyn EnforcementPort> {
    match &config.enforce.command {
        Some(command) => Arc::new(enforce::CommandEnforcer::new(command.clone())),
        None => Arc::new(enforce::NullEnforcer),
    }
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<22} {value}\n"));
}

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults — no .ritual/config.toml found)".to_string())
}

fn render_config_human(config: &RitualConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();

    output.push_str("Defaults\n");
    push_kv(&mut output, "user", &config.defaults.user);
    push_kv(&mut output, "preferred_level", config.defaults.preferred_level);
    push_kv(&mut output, "min_bypass_level", config.defaults.min_bypass_level);
    push_kv(&mut output, "bypass_minutes", config.defaults.bypass_minutes);
    push_kv(&mut output, "bypass_reduction", config.defaults.bypass_reduction);
    output.push('\n');

    output.push_str("Window\n");
    push_kv(
        &mut output,
        "hours",
        format!("{:02}:00-{:02}:00", config.window.start_hour, config.window.end_hour),
    );
    push_kv(
        &mut output,
        "sweep_interval",
        format!("{}m", config.window.sweep_interval_minutes),
    );
    output.push('\n');

    output.push_str("Schedule\n");
    match config.schedule.build() {
        Ok(schedule) => {
            for (minutes, level) in schedule.thresholds() {
                output.push_str(&format!("  {minutes:>4}m => level {level}\n"));
            }
        }
        Err(err) => push_kv(&mut output, "error", err),
    }
    output.push('\n');

    output.push_str("Hijack\n");
    push_kv(&mut output, "base_apps", config.hijack.base_apps.join(", "));
    push_kv(&mut output, "level9_apps", config.hijack.level9_apps.join(", "));
    output.push('\n');

    output.push_str("Notify\n");
    let mode = match config.notify.mode {
        NotifyMode::Log => "log",
        NotifyMode::Telegram => "telegram",
    };
    push_kv(&mut output, "mode", mode);
    push_kv(
        &mut output,
        "telegram_chat_id",
        config.notify.telegram_chat_id.as_deref().unwrap_or("(none)"),
    );
    output.push('\n');

    output.push_str("Enforce\n");
    push_kv(
        &mut output,
        "command",
        config.enforce.command.as_deref().unwrap_or("(none)"),
    );
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

fn render_config_json(config: &RitualConfig, config_path: Option<&Path>) -> Result<String> {
    let thresholds: Vec<(u32, u8)> = config
        .schedule
        .build()
        .map(|s| s.thresholds().to_vec())
        .unwrap_or_default();

    let payload = serde_json::json!({
        "defaults": {
            "user": &config.defaults.user,
            "preferred_level": config.defaults.preferred_level,
            "min_bypass_level": config.defaults.min_bypass_level,
            "bypass_minutes": config.defaults.bypass_minutes,
            "bypass_reduction": config.defaults.bypass_reduction
        },
        "window": {
            "start_hour": config.window.start_hour,
            "end_hour": config.window.end_hour,
            "sweep_interval_minutes": config.window.sweep_interval_minutes
        },
        "schedule": { "thresholds": thresholds },
        "hijack": {
            "base_apps": &config.hijack.base_apps,
            "level9_apps": &config.hijack.level9_apps
        },
        "notify": {
            "mode": match config.notify.mode {
                NotifyMode::Log => "log",
                NotifyMode::Telegram => "telegram",
            },
            "telegram_chat_id": config.notify.telegram_chat_id.clone()
        },
        "enforce": { "command": config.enforce.command.clone() },
        "source_path": config_source_label(config_path)
    });

    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

fn render_status_human(status: &StatusSnapshot) -> String {
    let mut output = String::new();
    let session = &status.session;

    output.push_str("Session\n");
    push_kv(&mut output, "user", &session.user_id);
    push_kv(&mut output, "level", session.current_level);
    if let Ok(info) = catalog::level_info(session.current_level) {
        push_kv(&mut output, "meaning", info.consequence);
    }
    push_kv(
        &mut output,
        "started",
        session.start_time.with_timezone(&Local).format("%H:%M"),
    );
    push_kv(&mut output, "escalations", session.escalation_count);
    push_kv(&mut output, "bypass_requests", session.bypass_request_count);
    if let Some(pending) = &session.pending_suggestion {
        push_kv(
            &mut output,
            "pending_suggestion",
            format!("level {} ({})", pending.suggested_level, pending.reason),
        );
    }
    if session.hijack_pending_confirmation {
        push_kv(&mut output, "hijack", "awaiting confirmation");
    }

    if let Some(hijack) = &status.hijack {
        output.push('\n');
        output.push_str("Hijack\n");
        push_kv(&mut output, "level", hijack.level);
        push_kv(&mut output, "allowed_apps", hijack.allowed_apps.join(", "));
        push_kv(&mut output, "escape_attempts", hijack.escape_attempts);
    }

    if let Some(grant) = &status.bypass {
        output.push('\n');
        output.push_str("Bypass\n");
        push_kv(&mut output, "reason", &grant.reason);
        push_kv(
            &mut output,
            "expires",
            grant.expires_at.with_timezone(&Local).format("%H:%M"),
        );
        push_kv(&mut output, "restores_to", grant.original_level);
    }

    output
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_read_only = matches!(
        &cli.command,
        Command::Config { .. } | Command::Status { .. }
    );

    let filter = match cli.verbose {
        0 if is_read_only => "ritual=warn",
        0 => "ritual=info",
        1 => "ritual=debug",
        _ => "ritual=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = RitualConfig::load(&cwd)?;

    if let Command::Config { json } = cli.command {
        if json {
            println!("{}", render_config_json(&config, config_path.as_deref())?);
        } else {
            print!("{}", render_config_human(&config, config_path.as_deref()));
        }
        return Ok(());
    }

    match config_path {
        Some(ref p) => info!("loaded config from {}", p.display()),
        None => info!("no .ritual/config.toml found, using defaults"),
    }

    let ritual_dir = paths::resolve_ritual_dir(&cwd);
    let store = Arc::new(
        store::StateStore::open(&paths::state_db_path(&ritual_dir))
            .context("failed to open state database")?,
    );
    let log = Arc::new(log::TransitionLog::new(&paths::transition_log_path(
        &ritual_dir,
    ))?);
    let engine = Engine::new(
        &config,
        store,
        log,
        build_notifier(&config)?,
        build_enforcer(&config),
    )?;

    let user = cli.user.as_deref().unwrap_or(&config.defaults.user);
    let now = Utc::now();

    match cli.command {
        Command::Start => {
            let session = engine.start_session(user, now)?;
            println!(
                "[ritual] session opened for {} at level {}",
                user, session.current_level
            );
        }
        Command::Complete => {
            let session = engine.complete_session(user, now)?;
            println!(
                "[ritual] plan written — enforcement released (peaked at level {})",
                session.current_level
            );
        }
        Command::Status { json } => {
            let status = engine.status(user)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print!("{}", render_status_human(&status));
            }
        }
        Command::Bypass { reason, minutes } => {
            let grant = engine.request_bypass(user, &reason, minutes, now)?;
            println!(
                "[ritual] bypass granted until {} — level eased {} -> {}",
                grant.expires_at.with_timezone(&Local).format("%H:%M"),
                grant.original_level,
                grant.temporary_level
            );
        }
        Command::Pattern {
            kind,
            severity,
            duration,
        } => {
            let signal = PatternSignal {
                kind: kind.into(),
                severity: severity.into(),
                duration_minutes: duration,
            };
            let outcome = engine.pattern_event(user, &[signal], now)?;
            match outcome.suggestion {
                Some(pending) => println!(
                    "[ritual] suggestion raised: level {} ({}); answer with `ritual suggestion accept|decline`",
                    pending.suggested_level, pending.reason
                ),
                None => println!("[ritual] noted — no level change suggested"),
            }
        }
        Command::Suggestion { answer } => match answer {
            Answer::Accept => {
                let session = engine.accept_suggestion(user, now)?;
                println!("[ritual] level is now {}", session.current_level);
            }
            Answer::Decline => {
                engine.decline_suggestion(user)?;
                println!("[ritual] suggestion declined, level unchanged");
            }
        },
        Command::Hijack { answer } => match answer {
            HijackAnswer::Confirm => {
                let session = engine.answer_hijack(user, true, now)?;
                println!(
                    "[ritual] focus lockdown engaged at level {}",
                    session.current_level
                );
            }
            HijackAnswer::Decline => match engine.answer_hijack(user, false, now) {
                Err(EngineError::HijackConfirmationDeclined(_)) => {
                    println!("[ritual] declined — holding at level 8, the next sweep will ask again");
                }
                Err(err) => return Err(err.into()),
                Ok(_) => {}
            },
        },
        Command::Escape => {
            let count = engine.record_escape_attempt(user)?;
            println!("[ritual] escape attempt recorded ({count} this session)");
        }
        Command::Run => {
            println!(
                "[ritual] enforcement loop running (window {:02}:00-{:02}:00, sweep every {}m); Ctrl-C to stop",
                config.window.start_hour,
                config.window.end_hour,
                config.window.sweep_interval_minutes
            );
            daemon::run(&engine, &config.window)?;
        }
        Command::Config { .. } => unreachable!("handled before engine construction"),
    }

    Ok(())
}
