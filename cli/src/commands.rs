//! Command handlers.
//!
//! Handlers print for a person reading a terminal; every decision stays in
//! the engine and the reconciler.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand};
use haven_config::Settings;
use haven_engine::{
    CheckpointOutcome, Engine, EngineOptions, NavigationOutcome, NavigationRequest,
    RecoveryReport, SystemClock,
};
use haven_sync::{
    ConnectivityFlag, ContentCache, HttpContentSource, LastSync, Reconciler, ReconcilerOptions, SyncOutcome,
    SyncReport, SyncScheduler,
};
use haven_types::{ConfirmationToken, JournalResolution, NavEvent, SessionStatus, TriggerToken};

/// Exit code for a request the engine declined. Not a failure.
const REJECTED_EXIT: u8 = 2;
const DEFAULT_LIMIT: usize = 20;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the current mode, route and open session.
    Status,

    /// Request a transition to a route.
    Navigate(NavigateArgs),

    /// Save a JSON payload into the current mode's session.
    Checkpoint {
        /// JSON value, e.g. '{"step": 3}'.
        payload: String,
    },

    /// State versions, newest first.
    History {
        #[arg(long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,
    },

    /// Journal entries, newest first.
    Journal {
        #[arg(long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,
    },

    /// Logged rejections, newest first.
    Rejections {
        #[arg(long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,
    },

    /// Session records.
    Sessions {
        /// Only sessions with this status (active, completed, abandoned, recovered).
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,
    },

    /// Refresh cached reference content.
    Sync {
        /// Pretend the device has no network.
        #[arg(long)]
        offline: bool,
        /// Keep syncing on the configured interval until interrupted.
        #[arg(long)]
        watch: bool,
    },

    /// Cached reference content and local edits.
    Content {
        #[command(subcommand)]
        command: ContentCommand,
    },

    /// UI preferences.
    Prefs {
        #[command(subcommand)]
        command: PrefsCommand,
    },

    /// Set the unreadable database aside and start again in IDLE.
    StartFresh,
}

#[derive(Args, Debug)]
pub struct NavigateArgs {
    pub route: String,
    /// activate, navigate, escalate_crisis, deescalate, lock, stand_down, abandon_attempt
    pub event: String,
    /// Source of the user's action, e.g. "tap:panic".
    #[arg(long)]
    pub trigger: Option<String>,
    /// Source of the user's confirmation, e.g. "hold:confirm".
    #[arg(long)]
    pub confirm: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum ContentCommand {
    List,
    /// Mark an item as edited locally; sync stops replacing it.
    Edit { source_id: String },
    /// Clear a local edit; deferred remote updates apply on the next sync.
    Resolve { source_id: String },
    /// Items with unresolved local edits.
    Edits,
}

#[derive(Subcommand, Debug)]
pub enum PrefsCommand {
    Get { key: String },
    Set { key: String, value: String },
}

pub async fn run(command: Command, settings: &Settings) -> Result<ExitCode> {
    match command {
        Command::Sync { offline, watch } => return sync(settings, offline, watch).await,
        Command::StartFresh => return start_fresh(settings),
        Command::Content { command } => return content(settings, command),
        _ => {}
    }

    let mut engine = open_engine(settings)?;
    let code = with_engine(&mut engine, command);
    engine.shutdown().context("failed to record clean shutdown")?;
    code
}

fn with_engine(engine: &mut Engine, command: Command) -> Result<ExitCode> {
    match command {
        Command::Status => status(engine)?,
        Command::Navigate(args) => return navigate(engine, &args),
        Command::Checkpoint { payload } => checkpoint(engine, &payload)?,
        Command::History { limit } => {
            for version in engine.history(limit)? {
                let state = &version.state;
                println!(
                    "{:>6}  {:<16} {:<12} since {}",
                    version.version.value(),
                    state.mode.as_str(),
                    state.route.as_str(),
                    state.entered_at.to_rfc3339()
                );
            }
        }
        Command::Journal { limit } => {
            for entry in engine.journal(limit)? {
                let status = if entry.committed {
                    "committed"
                } else {
                    entry.resolution.map_or("pending", JournalResolution::as_str)
                };
                let event = entry.intent.event.map_or("-", NavEvent::as_str);
                println!(
                    "{:>6}  {:<10} {:<16} {:<10} -> {} {}",
                    entry.seq.value(),
                    entry.intent.kind.as_str(),
                    event,
                    status,
                    entry.target.mode,
                    entry.target.route
                );
            }
        }
        Command::Rejections { limit } => {
            for rejection in engine.rejections(limit)? {
                println!(
                    "{}  {:<16} {:<16} {} -> {}: {}",
                    rejection.recorded_at.to_rfc3339(),
                    rejection.mode.as_str(),
                    rejection.event.as_str(),
                    rejection.current_route,
                    rejection.requested_route,
                    rejection.reason
                );
            }
        }
        Command::Sessions { status, limit } => {
            let status = status
                .map(|s| s.parse::<SessionStatus>())
                .transpose()
                .context("invalid --status")?;
            for session in engine.sessions(status, limit)? {
                println!(
                    "{}  {:<16} {:<10} started {} last {}",
                    session.id,
                    session.mode.as_str(),
                    session.status.as_str(),
                    session.started_at.to_rfc3339(),
                    session.last_checkpoint_at.to_rfc3339()
                );
            }
        }
        Command::Prefs { command } => match command {
            PrefsCommand::Get { key } => match engine.preference(&key)? {
                Some(value) => println!("{value}"),
                None => println!("(unset)"),
            },
            PrefsCommand::Set { key, value } => engine.set_preference(&key, &value)?,
        },
        Command::Sync { .. } | Command::StartFresh | Command::Content { .. } => {
            bail!("command does not run against an open engine")
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn open_engine(settings: &Settings) -> Result<Engine> {
    let path = settings.app.database_path();
    match Engine::open(
        &path,
        EngineOptions::from_settings(settings),
        Arc::new(SystemClock),
    ) {
        Ok((engine, report)) => {
            print_recovery(&report);
            Ok(engine)
        }
        Err(err) => {
            eprintln!("{}", err.user_message());
            if let Some(action) = err.recovery_action() {
                eprintln!("Run `haven {}` to continue.", action.label().replace('_', "-"));
            }
            Err(err).with_context(|| format!("could not open {}", path.display()))
        }
    }
}

fn print_recovery(report: &RecoveryReport) {
    if let Some(corruption) = &report.corruption {
        println!(
            "Your saved progress was restored. The damaged copy was kept at {}.",
            corruption.quarantined.display()
        );
    } else if report.resumed {
        println!("Picking up where you left off.");
    }
}

fn status(engine: &Engine) -> Result<()> {
    let state = engine.state();
    println!("mode:    {}", state.mode);
    println!("route:   {}", state.route);
    println!("since:   {}", state.entered_at.to_rfc3339());
    println!("version: {}", engine.version());
    if let Some(remaining) = engine.containment_remaining() {
        println!("containment remaining: {}s", remaining.as_secs());
    }
    if let Some(session) = engine.open_session()? {
        println!(
            "session: {} ({}, last saved {})",
            session.id,
            session.status,
            session.last_checkpoint_at.to_rfc3339()
        );
    }

    let stats = engine.journal_stats()?;
    println!(
        "journal: {} entries, {} committed, {} pending, {} aborted, {} superseded",
        stats.total_entries,
        stats.committed_entries,
        stats.pending_entries,
        stats.aborted_entries,
        stats.superseded_entries
    );
    Ok(())
}

fn navigate(engine: &mut Engine, args: &NavigateArgs) -> Result<ExitCode> {
    let event: NavEvent = args.event.parse()?;
    let mut request = NavigationRequest::new(args.route.as_str(), event);
    if let Some(trigger) = &args.trigger {
        let trigger = TriggerToken::new(trigger.as_str()).context("invalid --trigger")?;
        request = request.with_trigger(trigger);
    }
    if let Some(confirm) = &args.confirm {
        let confirm = ConfirmationToken::new(confirm.as_str()).context("invalid --confirm")?;
        request = request.with_confirmation(confirm);
    }

    match engine.request_transition(&request) {
        NavigationOutcome::Approved { route, mode } => {
            println!("{route} ({mode})");
            Ok(ExitCode::SUCCESS)
        }
        NavigationOutcome::Rejected(reason) => {
            println!("{}", reason.message());
            println!("[{reason}]");
            Ok(ExitCode::from(REJECTED_EXIT))
        }
    }
}

fn checkpoint(engine: &mut Engine, payload: &str) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("payload must be valid JSON")?;
    match engine.checkpoint(payload)? {
        CheckpointOutcome::Saved { session, seq } => println!("saved to {session} (entry {seq})"),
        CheckpointOutcome::NoOpenSession => println!("No session is open in this mode."),
    }
    Ok(())
}

fn open_cache(settings: &Settings) -> Result<ContentCache> {
    let path = settings.app.content_database_path();
    ContentCache::open(&path, &settings.store)
        .with_context(|| format!("could not open the content cache at {}", path.display()))
}

fn content(settings: &Settings, command: ContentCommand) -> Result<ExitCode> {
    let cache = open_cache(settings)?;
    match command {
        ContentCommand::List => {
            let edited = cache.unresolved_edits()?;
            for entry in cache.entries()? {
                let marker = if edited.contains(&entry.source_id) { "*" } else { " " };
                println!(
                    "{marker} {:<32} {}  (fetched {})",
                    entry.source_id,
                    entry.content.title,
                    entry.fetched_at.to_rfc3339()
                );
            }
        }
        ContentCommand::Edit { source_id } => cache.mark_local_edit(&source_id)?,
        ContentCommand::Resolve { source_id } => cache.resolve_local_edit(&source_id)?,
        ContentCommand::Edits => {
            for source_id in cache.unresolved_edits()? {
                println!("{source_id}");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn start_fresh(settings: &Settings) -> Result<ExitCode> {
    let path = settings.app.database_path();
    let (engine, _) = Engine::start_fresh(
        &path,
        EngineOptions::from_settings(settings),
        Arc::new(SystemClock),
    )
    .with_context(|| format!("could not start fresh at {}", path.display()))?;
    println!("Starting fresh. You're in {}.", engine.state().route);
    engine.shutdown()?;
    Ok(ExitCode::SUCCESS)
}

async fn sync(settings: &Settings, offline: bool, watch: bool) -> Result<ExitCode> {
    if !settings.sync.is_active() {
        println!("Sync is off: no endpoint is configured or it is disabled.");
        return Ok(ExitCode::SUCCESS);
    }

    let cache = open_cache(settings)?;
    let source = HttpContentSource::from_settings(&settings.sync)?;
    let reconciler = Reconciler::new(
        cache,
        source,
        ConnectivityFlag::new(!offline),
        ReconcilerOptions::from_settings(settings),
    );

    if watch {
        return watch_sync(reconciler, settings.sync.interval).await;
    }

    match reconciler.sync().await {
        SyncOutcome::Updated(report) => print_report(&report),
        SyncOutcome::Skipped(reason) => println!("Sync skipped ({reason})."),
        SyncOutcome::Failed(failure) => {
            // Failures never block anything; report and move on.
            println!(
                "Sync did not complete ({}). Cached content is unchanged.",
                failure.code()
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn watch_sync(
    reconciler: Reconciler<HttpContentSource, ConnectivityFlag>,
    interval: Duration,
) -> Result<ExitCode> {
    let scheduler = SyncScheduler::spawn(reconciler, interval);
    let mut status = scheduler.subscribe();
    println!("Syncing every {}s. Press Ctrl-C to stop.", interval.as_secs());

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if current.running {
                    continue;
                }
                match &current.last {
                    Some(LastSync::Updated(report)) => print_report(report),
                    Some(LastSync::Skipped(reason)) => println!("Sync skipped ({reason})."),
                    Some(LastSync::Failed { code, .. }) => {
                        println!("Sync did not complete ({code}).");
                    }
                    None => {}
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    scheduler.cancel();
    Ok(ExitCode::SUCCESS)
}

fn print_report(report: &SyncReport) {
    println!(
        "Sync complete: {} received, {} written, {} unchanged, {} kept local, {} deferred, {} applied, {} rejected.",
        report.received,
        report.written,
        report.unchanged,
        report.kept_local,
        report.deferred,
        report.applied_deferred,
        report.rejected
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_store::Store;

    fn settings(dir: &std::path::Path) -> Settings {
        let mut settings = Settings::default();
        settings.app.data_dir = dir.to_path_buf();
        settings
    }

    fn navigate_args(route: &str, event: &str, trigger: Option<&str>) -> NavigateArgs {
        NavigateArgs {
            route: route.to_string(),
            event: event.to_string(),
            trigger: trigger.map(str::to_string),
            confirm: None,
        }
    }

    #[test]
    fn navigate_reports_rejection_as_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(&settings(dir.path())).unwrap();

        let code = navigate(&mut engine, &navigate_args("home", "activate", None)).unwrap();
        assert_eq!(code, ExitCode::SUCCESS);

        let code = navigate(&mut engine, &navigate_args("panic", "escalate_crisis", None)).unwrap();
        assert_eq!(code, ExitCode::from(REJECTED_EXIT));

        let code =
            navigate(&mut engine, &navigate_args("panic", "escalate", Some("tap:panic"))).unwrap();
        assert_eq!(code, ExitCode::SUCCESS);
        assert_eq!(engine.state().route.as_str(), "panic");
    }

    #[test]
    fn unknown_event_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = open_engine(&settings(dir.path())).unwrap();
        assert!(navigate(&mut engine, &navigate_args("home", "teleport", None)).is_err());
    }

    #[tokio::test]
    async fn commands_leave_a_clean_shutdown_behind() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());

        run(Command::Status, &settings).await.unwrap();
        let (_, report) = Engine::open(
            &settings.app.database_path(),
            EngineOptions::from_settings(&settings),
            Arc::new(SystemClock),
        )
        .unwrap();
        assert!(!report.first_launch);
        assert!(!report.resumed);
    }

    #[tokio::test]
    async fn sync_without_endpoint_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let code = sync(&settings(dir.path()), false, false).await.unwrap();
        assert_eq!(code, ExitCode::SUCCESS);
        assert!(!settings(dir.path()).app.database_path().exists());
        assert!(!settings(dir.path()).app.content_database_path().exists());
    }

    #[test]
    fn content_edits_do_not_open_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let edit = ContentCommand::Edit {
            source_id: "box-breathing".to_string(),
        };
        assert_eq!(content(&settings, edit).unwrap(), ExitCode::SUCCESS);

        assert!(!settings.app.database_path().exists());
        let cache = open_cache(&settings).unwrap();
        assert_eq!(cache.unresolved_edits().unwrap(), vec!["box-breathing"]);
    }

    #[test]
    fn navigation_proceeds_while_a_content_batch_is_open() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let mut engine = open_engine(&settings).unwrap();

        let mut cache =
            Store::open_content(settings.app.content_database_path(), &settings.store).unwrap();
        let batch = cache.begin_transaction().unwrap();

        let code = navigate(&mut engine, &navigate_args("home", "activate", None)).unwrap();
        assert_eq!(code, ExitCode::SUCCESS);
        let code =
            navigate(&mut engine, &navigate_args("panic", "escalate", Some("tap:panic"))).unwrap();
        assert_eq!(code, ExitCode::SUCCESS);
        batch.rollback().unwrap();
    }
}
