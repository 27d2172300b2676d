//! Configuration loading for Haven.
//!
//! The on-disk file is optional and every section inside it is optional.
//! [`HavenConfig`] mirrors the TOML as written; [`Settings`] is the resolved
//! view with defaults filled in that the rest of the workspace consumes.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use haven_types::LocalEditPolicy;
use serde::Deserialize;
use thiserror::Error;

const CONFIG_ENV: &str = "HAVEN_CONFIG";
const DEFAULT_DIR_NAME: &str = ".haven";

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 250;
pub const DEFAULT_WRITE_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_WRITE_RETRY_INITIAL_MS: u64 = 20;
/// Minimum time in NIGHT_WATCH before DEESCALATE is honored.
pub const DEFAULT_MIN_CONTAINMENT_SECS: u64 = 20 * 60;
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 15 * 60;
pub const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SYNC_BATCH_SIZE: usize = 50;
pub const DEFAULT_SYNC_MAX_BODY_BYTES: usize = 1024 * 1024;
pub const DEFAULT_SYNC_MAX_RETRIES: u32 = 2;
pub const DEFAULT_USER_AGENT: &str = concat!("haven/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Default, Deserialize)]
pub struct HavenConfig {
    pub app: Option<AppConfig>,
    pub store: Option<StoreConfig>,
    pub policy: Option<PolicyConfig>,
    pub sync: Option<SyncConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AppConfig {
    /// Directory holding the database and logs. `~` and `${VAR}` are expanded.
    pub data_dir: Option<String>,
    pub log_filter: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StoreConfig {
    pub busy_timeout_ms: Option<u64>,
    pub write_retry_attempts: Option<u32>,
    pub write_retry_initial_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PolicyConfig {
    pub min_containment_secs: Option<u64>,
    /// `keep_local` or `defer`.
    pub local_edit_policy: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncConfig {
    pub enabled: Option<bool>,
    pub endpoint: Option<String>,
    pub interval_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub batch_size: Option<usize>,
    pub max_body_bytes: Option<usize>,
    pub max_retries: Option<u32>,
    pub user_agent: Option<String>,
}

/// Expand `${VAR}` references from the environment.
///
/// Missing variables expand to the empty string; an unclosed `${` is kept verbatim.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find('}') {
            Some(close) => {
                let var = &after[..close];
                if var.is_empty() {
                    out.push_str("${}");
                } else {
                    out.push_str(&env::var(var).unwrap_or_default());
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn expand_path(raw: &str) -> PathBuf {
    let expanded = expand_env_vars(raw);
    if expanded == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = expanded.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(expanded)
}

impl HavenConfig {
    /// Load from [`config_path`]. A missing file is not an error.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }
}

/// `$HAVEN_CONFIG` when set, otherwise `~/.haven/config.toml`.
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    if let Ok(explicit) = env::var(CONFIG_ENV)
        && !explicit.trim().is_empty()
    {
        return Some(expand_path(&explicit));
    }
    dirs::home_dir().map(|home| home.join(DEFAULT_DIR_NAME).join("config.toml"))
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir().map_or_else(
        || PathBuf::from(DEFAULT_DIR_NAME),
        |home| home.join(DEFAULT_DIR_NAME),
    )
}

// ============================================================================
// Resolved settings
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub app: AppSettings,
    pub store: StoreSettings,
    pub policy: PolicySettings,
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSettings {
    pub data_dir: PathBuf,
    pub log_filter: String,
}

impl AppSettings {
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("haven.db")
    }

    /// The reference-content cache. Kept apart from the engine database so
    /// sync and navigation never wait on the same write lock.
    #[must_use]
    pub fn content_database_path(&self) -> PathBuf {
        self.data_dir.join("content.db")
    }

    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSettings {
    pub busy_timeout: Duration,
    pub write_retry_attempts: u32,
    pub write_retry_initial: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            write_retry_attempts: DEFAULT_WRITE_RETRY_ATTEMPTS,
            write_retry_initial: Duration::from_millis(DEFAULT_WRITE_RETRY_INITIAL_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicySettings {
    pub min_containment: Duration,
    pub local_edit_policy: LocalEditPolicy,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            min_containment: Duration::from_secs(DEFAULT_MIN_CONTAINMENT_SECS),
            local_edit_policy: LocalEditPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub enabled: bool,
    /// Sync stays off without an endpoint even when `enabled` is set.
    pub endpoint: Option<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub batch_size: usize,
    pub max_body_bytes: usize,
    pub max_retries: u32,
    pub user_agent: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: None,
            interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            timeout: Duration::from_secs(DEFAULT_SYNC_TIMEOUT_SECS),
            batch_size: DEFAULT_SYNC_BATCH_SIZE,
            max_body_bytes: DEFAULT_SYNC_MAX_BODY_BYTES,
            max_retries: DEFAULT_SYNC_MAX_RETRIES,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl SyncSettings {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.enabled && self.endpoint.is_some()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::resolve(None)
    }
}

impl Settings {
    /// Fill defaults for everything `config` leaves out.
    #[must_use]
    pub fn resolve(config: Option<&HavenConfig>) -> Self {
        let app = config.and_then(|c| c.app.as_ref());
        let store = config.and_then(|c| c.store.as_ref());
        let policy = config.and_then(|c| c.policy.as_ref());
        let sync = config.and_then(|c| c.sync.as_ref());

        let app = AppSettings {
            data_dir: app
                .and_then(|a| a.data_dir.as_deref())
                .filter(|raw| !raw.trim().is_empty())
                .map_or_else(default_data_dir, expand_path),
            log_filter: app
                .and_then(|a| a.log_filter.clone())
                .filter(|f| !f.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
        };

        let store_defaults = StoreSettings::default();
        let store = StoreSettings {
            busy_timeout: store
                .and_then(|s| s.busy_timeout_ms)
                .map_or(store_defaults.busy_timeout, Duration::from_millis),
            write_retry_attempts: store
                .and_then(|s| s.write_retry_attempts)
                .unwrap_or(store_defaults.write_retry_attempts),
            write_retry_initial: store
                .and_then(|s| s.write_retry_initial_ms)
                .map_or(store_defaults.write_retry_initial, Duration::from_millis),
        };

        let policy_defaults = PolicySettings::default();
        let policy = PolicySettings {
            min_containment: policy
                .and_then(|p| p.min_containment_secs)
                .map_or(policy_defaults.min_containment, Duration::from_secs),
            local_edit_policy: policy
                .and_then(|p| p.local_edit_policy.as_deref())
                .map_or(policy_defaults.local_edit_policy, |raw| {
                    raw.parse().unwrap_or_else(|err| {
                        tracing::warn!("{err}; using keep_local");
                        LocalEditPolicy::KeepLocal
                    })
                }),
        };

        let sync_defaults = SyncSettings::default();
        let sync = SyncSettings {
            enabled: sync.and_then(|s| s.enabled).unwrap_or(sync_defaults.enabled),
            endpoint: sync
                .and_then(|s| s.endpoint.as_deref())
                .map(expand_env_vars)
                .filter(|e| !e.trim().is_empty()),
            interval: sync
                .and_then(|s| s.interval_secs)
                .filter(|secs| *secs > 0)
                .map_or(sync_defaults.interval, Duration::from_secs),
            timeout: sync
                .and_then(|s| s.timeout_secs)
                .filter(|secs| *secs > 0)
                .map_or(sync_defaults.timeout, Duration::from_secs),
            batch_size: sync
                .and_then(|s| s.batch_size)
                .filter(|n| *n > 0)
                .unwrap_or(sync_defaults.batch_size),
            max_body_bytes: sync
                .and_then(|s| s.max_body_bytes)
                .filter(|n| *n > 0)
                .unwrap_or(sync_defaults.max_body_bytes),
            max_retries: sync
                .and_then(|s| s.max_retries)
                .unwrap_or(sync_defaults.max_retries),
            user_agent: sync
                .and_then(|s| s.user_agent.as_deref())
                .map(expand_env_vars)
                .filter(|ua| !ua.trim().is_empty())
                .unwrap_or(sync_defaults.user_agent),
        };

        Self {
            app,
            store,
            policy,
            sync,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_env_vars_no_vars() {
        assert_eq!(expand_env_vars("hello world"), "hello world");
    }

    #[test]
    fn expand_env_vars_single_var() {
        unsafe {
            std::env::set_var("HAVEN_TEST_CONFIG_VAR", "replaced");
        }
        let result = expand_env_vars("prefix ${HAVEN_TEST_CONFIG_VAR} suffix");
        assert_eq!(result, "prefix replaced suffix");
        unsafe {
            std::env::remove_var("HAVEN_TEST_CONFIG_VAR");
        }
    }

    #[test]
    fn expand_env_vars_missing_var_becomes_empty() {
        unsafe {
            std::env::remove_var("HAVEN_MISSING_VAR_FOR_TEST");
        }
        let result = expand_env_vars("before ${HAVEN_MISSING_VAR_FOR_TEST} after");
        assert_eq!(result, "before  after");
    }

    #[test]
    fn expand_env_vars_unclosed_brace_preserved() {
        assert_eq!(expand_env_vars("value ${UNCLOSED"), "value ${UNCLOSED");
    }

    #[test]
    fn expand_env_vars_empty_var_name_preserved() {
        assert_eq!(expand_env_vars("a ${} b"), "a ${} b");
    }

    #[test]
    fn expand_env_vars_unicode_content() {
        assert_eq!(expand_env_vars("café ${} ünïcode"), "café ${} ünïcode");
    }

    #[test]
    fn parse_empty_config() {
        let config: HavenConfig = toml::from_str("").unwrap();
        assert!(config.app.is_none());
        assert!(config.sync.is_none());
        let settings = Settings::resolve(Some(&config));
        assert_eq!(settings.store, StoreSettings::default());
        assert_eq!(settings.policy, PolicySettings::default());
        assert!(!settings.sync.is_active());
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[app]
data_dir = "/var/lib/haven"
log_filter = "haven_engine=debug"

[store]
busy_timeout_ms = 500
write_retry_attempts = 5
write_retry_initial_ms = 10

[policy]
min_containment_secs = 60
local_edit_policy = "defer"

[sync]
endpoint = "https://content.example.org/v1/resources.json"
interval_secs = 300
batch_size = 10
"#;
        let config: HavenConfig = toml::from_str(toml_str).unwrap();
        let settings = Settings::resolve(Some(&config));
        assert_eq!(settings.app.data_dir, PathBuf::from("/var/lib/haven"));
        assert_eq!(
            settings.app.database_path(),
            PathBuf::from("/var/lib/haven/haven.db")
        );
        assert_eq!(
            settings.app.content_database_path(),
            PathBuf::from("/var/lib/haven/content.db")
        );
        assert_eq!(settings.app.log_filter, "haven_engine=debug");
        assert_eq!(settings.store.busy_timeout, Duration::from_millis(500));
        assert_eq!(settings.store.write_retry_attempts, 5);
        assert_eq!(settings.policy.min_containment, Duration::from_secs(60));
        assert_eq!(settings.policy.local_edit_policy, LocalEditPolicy::Defer);
        assert!(settings.sync.is_active());
        assert_eq!(settings.sync.interval, Duration::from_secs(300));
        assert_eq!(settings.sync.batch_size, 10);
        assert_eq!(settings.sync.timeout, Duration::from_secs(DEFAULT_SYNC_TIMEOUT_SECS));
    }

    #[test]
    fn unknown_local_edit_policy_falls_back() {
        let config: HavenConfig = toml::from_str(
            r#"
[policy]
local_edit_policy = "remote_wins"
"#,
        )
        .unwrap();
        let settings = Settings::resolve(Some(&config));
        assert_eq!(settings.policy.local_edit_policy, LocalEditPolicy::KeepLocal);
    }

    #[test]
    fn zero_intervals_fall_back_to_defaults() {
        let config: HavenConfig = toml::from_str(
            r"
[sync]
interval_secs = 0
batch_size = 0
",
        )
        .unwrap();
        let settings = Settings::resolve(Some(&config));
        assert_eq!(
            settings.sync.interval,
            Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS)
        );
        assert_eq!(settings.sync.batch_size, DEFAULT_SYNC_BATCH_SIZE);
    }

    #[test]
    fn disabled_sync_is_inactive_even_with_endpoint() {
        let config: HavenConfig = toml::from_str(
            r#"
[sync]
enabled = false
endpoint = "https://content.example.org/x.json"
"#,
        )
        .unwrap();
        assert!(!Settings::resolve(Some(&config)).sync.is_active());
    }

    #[test]
    fn load_from_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[store\nbusy_timeout_ms = 1").unwrap();
        let err = HavenConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.path(), path.as_path());
    }

    #[test]
    fn load_from_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = HavenConfig::load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
