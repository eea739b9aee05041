//! cw - command-line view of cowork coordination state

use std::fs;
use std::str::FromStr;

use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use serde_json::json;
use tracing::info;

use cowork::cli::{Cli, Command, OutputFormat, get_log_path};
use cowork::config::Config;
use cowork::coordinator::{Coordinator, MaintenanceReport};
use cowork::domain::{LockSummary, Owner, Priority, SessionStatus, SessionSummary, Target};

fn setup_logging(level: &str) -> Result<()> {
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Write to log file, not stdout/stderr
    let level = tracing::Level::from_str(level).map_err(|_| eyre!("Invalid log level: {}", level))?;
    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = cli
        .log_level
        .clone()
        .or_else(|| Config::load_log_level(cli.config.as_ref()))
        .unwrap_or_else(|| "info".to_string());
    setup_logging(&level).context("Failed to setup logging")?;

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    if let Some(store) = &cli.store {
        config.store.root = store.clone();
    }
    info!(root = %config.store.root.display(), "cw loaded config");

    let coordinator = Coordinator::open(config).context("Failed to open store")?;

    match cli.command {
        Command::Sessions => print_sessions(&coordinator.list_sessions().await, cli.format)?,
        Command::Locks => print_locks(&coordinator.list_locks().await, cli.format)?,
        Command::Publish {
            text,
            priority,
            to,
            topic,
        } => publish(&coordinator, &text, priority, to, &topic, cli.format).await?,
        Command::Maintain => {
            let report = coordinator.maintain().await.context("Maintenance pass failed")?;
            print_maintenance(&report, cli.format)?;
        }
    }

    Ok(())
}

async fn publish(
    coordinator: &Coordinator,
    text: &str,
    priority: Priority,
    to: Target,
    topic: &str,
    format: OutputFormat,
) -> Result<()> {
    let session_id = coordinator.start(Owner::current()).await.context("Failed to start session")?;
    let published = coordinator.publish(topic, json!(text), priority, to.clone()).await;
    let flushed = coordinator.flush().await;
    coordinator.stop().await.context("Failed to stop session")?;

    let message_id = published.context("Failed to publish")?;
    flushed.context("Failed to flush message")?;

    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({ "id": message_id, "sender": session_id, "topic": topic, "priority": priority, "target": to })
        ),
        OutputFormat::Text => println!(
            "{} {} [{}] to {} ({})",
            "Published".green().bold(),
            message_id,
            priority_label(priority),
            to,
            topic
        ),
    }
    Ok(())
}

fn print_sessions(sessions: &[SessionSummary], format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(sessions)?);
        return Ok(());
    }
    if sessions.is_empty() {
        println!("{}", "No live sessions".dimmed());
        return Ok(());
    }
    println!("{}", format!("{} live session(s)", sessions.len()).bold());
    for session in sessions {
        let status = match session.status {
            SessionStatus::Active => session.status.to_string().green(),
            SessionStatus::Idle => session.status.to_string().yellow(),
            SessionStatus::Disconnected => session.status.to_string().red(),
        };
        println!(
            "  {} [{}] pid {}@{} {} ({}s ago)",
            session.id.cyan(),
            status,
            session.pid,
            session.host,
            session.cwd.display(),
            session.inactive_secs
        );
        if let Some(task) = &session.current_task {
            println!("      task: {}", task);
        }
        if let Some(location) = &session.location {
            println!("      at:   {}", location);
        }
    }
    Ok(())
}

fn print_locks(locks: &[LockSummary], format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(locks)?);
        return Ok(());
    }
    if locks.is_empty() {
        println!("{}", "No locks held".dimmed());
        return Ok(());
    }
    println!("{}", format!("{} lock(s)", locks.len()).bold());
    for lock in locks {
        println!(
            "  {} [{}] {} held {}s, expires in {}s{}",
            lock.resource_key.cyan(),
            lock.mode.to_string().yellow(),
            lock.holder,
            lock.age_secs,
            lock.remaining_secs,
            lock.operation
                .as_deref()
                .map(|op| format!(" ({})", op))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn print_maintenance(report: &MaintenanceReport, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!(
            "{}",
            json!({
                "locks_swept": report.locks_swept,
                "sessions_idled": report.reap.idled,
                "sessions_removed": report.reap.removed,
                "locks_released": report.reap.locks_released,
                "batches_removed": report.gc.batches_removed,
                "ledgers_removed": report.gc.ledgers_removed,
            })
        );
        return Ok(());
    }
    println!("{}", "Maintenance complete".green().bold());
    println!("  expired locks swept:   {}", report.locks_swept);
    println!("  sessions idled:        {}", report.reap.idled.len());
    println!("  sessions removed:      {}", report.reap.removed.len());
    println!("  locks released:        {}", report.reap.locks_released);
    println!("  message batches freed: {}", report.gc.batches_removed);
    Ok(())
}

fn priority_label(priority: Priority) -> ColoredString {
    match priority {
        Priority::Normal => priority.to_string().normal(),
        Priority::High => priority.to_string().yellow(),
        Priority::Urgent => priority.to_string().red().bold(),
    }
}
