//! Haven CLI - binary entry point.
//!
//! Stands in for the rendering layer: every command opens the engine (which
//! runs crash recovery), performs one request, and shuts down cleanly.
//!
//! ```text
//! main() -> load settings -> init_tracing() -> commands::run()
//!                                                  |
//!                                Engine::open -> request -> Engine::shutdown
//! ```

mod commands;

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use haven_config::{HavenConfig, Settings};

use crate::commands::Command;

/// Mode-aware crisis navigation engine.
#[derive(Parser, Debug)]
#[command(name = "haven", version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (overrides HAVEN_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the database and logs.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let config = match &cli.config {
        Some(path) => Some(
            HavenConfig::load_from(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
        ),
        None => HavenConfig::load().context("failed to load config")?,
    };
    let mut settings = Settings::resolve(config.as_ref());
    if let Some(dir) = &cli.data_dir {
        settings.app.data_dir.clone_from(dir);
    }
    Ok(settings)
}

fn init_tracing(settings: &Settings) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.app.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (log_file, init_warnings) = open_log_file(settings);

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::debug!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // No log file: stay silent rather than mixing logs into command output.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_log_file(settings: &Settings) -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates(settings) {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates(settings: &Settings) -> Vec<PathBuf> {
    vec![
        settings.app.log_dir().join("haven.log"),
        PathBuf::from(".haven").join("logs").join("haven.log"),
    ]
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&settings);

    match commands::run(cli.command, &settings).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
