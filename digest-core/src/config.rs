//! Settings for the weekly digest pipeline.
//!
//! Loaded from `<home>/.weekly-digest/config.yaml`; every field has a
//! default, so a missing file (or a partial one) is valid. A handful of
//! endpoint and secret fields can be overridden from the environment.
//!
//! # API pattern
//!
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{config_io_err, ConfigError};
use crate::paths;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Bookmark archive (Readeck) connection and selection window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveSettings {
    pub url: String,
    pub token: String,
    pub lookback_days: u32,
    pub page_limit: u32,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            url: "http://readeck:8000".to_string(),
            token: String::new(),
            lookback_days: 7,
            page_limit: 100,
        }
    }
}

/// Notebook / generation service (Open Notebook) connection and profiles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotebookSettings {
    pub url: String,
    pub password: String,
    pub episode_profile: String,
    pub speaker_profile: String,
    /// Batch and episode names are `"<name_prefix> dd/mm/YYYY"`.
    pub name_prefix: String,
}

impl Default for NotebookSettings {
    fn default() -> Self {
        Self {
            url: "http://open-notebook-backend:5055".to_string(),
            password: String::new(),
            episode_profile: "default".to_string(),
            speaker_profile: "default".to_string(),
            name_prefix: "Semaine du".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    /// Six-field cron expression (seconds first).
    pub cron: String,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            cron: "0 0 23 * * Sun".to_string(),
        }
    }
}

/// Remote job polling budgets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub concurrency: usize,
    pub source_interval_secs: u64,
    pub generation_interval_secs: u64,
    pub max_interval_secs: u64,
    pub error_budget: u32,
    pub source_timeout_secs: u64,
    pub text_timeout_secs: u64,
    pub audio_timeout_secs: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            concurrency: 5,
            source_interval_secs: 5,
            generation_interval_secs: 10,
            max_interval_secs: 60,
            error_budget: 3,
            source_timeout_secs: 300,
            text_timeout_secs: 600,
            audio_timeout_secs: 600,
        }
    }
}

impl PollingSettings {
    /// Intervals and the concurrency limit must be non-zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("polling.concurrency", self.concurrency as u64),
            ("polling.source_interval_secs", self.source_interval_secs),
            ("polling.generation_interval_secs", self.generation_interval_secs),
            ("polling.max_interval_secs", self.max_interval_secs),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Wall-clock time a healthy run is expected to take at most.
    pub fn expected_run_duration(&self) -> Duration {
        Duration::from_secs(
            self.source_timeout_secs + self.text_timeout_secs + self.audio_timeout_secs,
        )
    }
}

/// Local audio publishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub enabled: bool,
    /// Defaults to `<home>/.weekly-digest/audio` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    pub public_url: String,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            local_path: None,
            public_url: "http://localhost/audio".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    /// Defaults to `<home>/.weekly-digest/state.db` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub retain_item_outcomes: bool,
    /// A `running` run that has not progressed for this many expected run
    /// durations is failed by the stale-run sweep.
    pub stale_after_factor: u32,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            path: None,
            retain_item_outcomes: true,
            stale_after_factor: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Console,
    Json,
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub archive: ArchiveSettings,
    pub notebook: NotebookSettings,
    pub schedule: ScheduleSettings,
    pub polling: PollingSettings,
    pub audio: AudioSettings,
    pub ledger: LedgerSettings,
    pub http_timeout_secs: u64,
    pub log_format: LogFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            archive: ArchiveSettings::default(),
            notebook: NotebookSettings::default(),
            schedule: ScheduleSettings::default(),
            polling: PollingSettings::default(),
            audio: AudioSettings::default(),
            ledger: LedgerSettings::default(),
            http_timeout_secs: 30,
            log_format: LogFormat::Console,
        }
    }
}

impl Settings {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Ledger database path, rooted at `home` unless configured explicitly.
    pub fn ledger_path(&self, home: &Path) -> PathBuf {
        self.ledger
            .path
            .clone()
            .unwrap_or_else(|| paths::ledger_path(home))
    }

    /// Audio upload directory, rooted at `home` unless configured explicitly.
    pub fn audio_dir(&self, home: &Path) -> PathBuf {
        self.audio
            .local_path
            .clone()
            .unwrap_or_else(|| paths::audio_dir(home))
    }

    /// Age after which a `running` run is considered abandoned.
    pub fn stale_after(&self) -> Duration {
        self.polling.expected_run_duration() * self.ledger.stale_after_factor.max(1)
    }

    /// Apply `DIGEST_*` overrides using `lookup` to read variables.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DIGEST_READECK_URL") {
            self.archive.url = url;
        }
        if let Some(token) = lookup("DIGEST_READECK_TOKEN") {
            self.archive.token = token;
        }
        if let Some(url) = lookup("DIGEST_NOTEBOOK_URL") {
            self.notebook.url = url;
        }
        if let Some(password) = lookup("DIGEST_NOTEBOOK_PASSWORD") {
            self.notebook.password = password;
        }
        if let Some(path) = lookup("DIGEST_DATABASE_PATH") {
            self.ledger.path = Some(PathBuf::from(path));
        }
        if let Some(format) = lookup("DIGEST_LOG_FORMAT") {
            self.log_format = match format.to_ascii_lowercase().as_str() {
                "console" => LogFormat::Console,
                "json" => LogFormat::Json,
                other => {
                    return Err(ConfigError::InvalidEnv {
                        var: "DIGEST_LOG_FORMAT",
                        reason: format!("expected 'console' or 'json', got '{other}'"),
                    })
                }
            };
        }
        self.polling.validate()
    }

    /// Apply `DIGEST_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|var| std::env::var(var).ok())
    }
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// Load settings from `<home>/.weekly-digest/config.yaml`, without env
/// overrides. A missing file yields [`Settings::default`].
pub fn load_at(home: &Path) -> Result<Settings, ConfigError> {
    let path = paths::config_path(home);
    if !path.exists() {
        return Ok(Settings::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| config_io_err(&path, e))?;
    if contents.trim().is_empty() {
        return Ok(Settings::default());
    }
    let settings: Settings =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?;
    settings.polling.validate()?;
    Ok(settings)
}

/// Load settings from the user's home directory and apply env overrides.
pub fn load() -> Result<Settings, ConfigError> {
    let mut settings = load_at(&home()?)?;
    settings.apply_env()?;
    Ok(settings)
}

/// Atomically write `settings` to `<home>/.weekly-digest/config.yaml`.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, settings: &Settings) -> Result<PathBuf, ConfigError> {
    let root = paths::digest_root(home);
    std::fs::create_dir_all(&root).map_err(|e| config_io_err(&root, e))?;

    let path = paths::config_path(home);
    let tmp = path.with_extension("yaml.tmp");
    let yaml = serde_yaml::to_string(settings)?;
    std::fs::write(&tmp, yaml).map_err(|e| config_io_err(&tmp, e))?;
    set_file_permissions(&tmp)?;
    std::fs::rename(&tmp, &path).map_err(|e| config_io_err(&path, e))?;
    Ok(path)
}

pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| config_io_err(path, e))
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let home = TempDir::new().unwrap();
        let settings = load_at(home.path()).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.polling.concurrency, 5);
        assert_eq!(settings.schedule.cron, "0 0 23 * * Sun");
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let home = TempDir::new().unwrap();
        let root = paths::digest_root(home.path());
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(
            paths::config_path(home.path()),
            "polling:\n  concurrency: 8\nnotebook:\n  password: s3cret\n",
        )
        .unwrap();

        let settings = load_at(home.path()).unwrap();
        assert_eq!(settings.polling.concurrency, 8);
        assert_eq!(settings.polling.source_timeout_secs, 300);
        assert_eq!(settings.notebook.password, "s3cret");
        assert_eq!(settings.notebook.episode_profile, "default");
    }

    #[test]
    fn zero_poll_interval_is_rejected_on_load() {
        let home = TempDir::new().unwrap();
        std::fs::create_dir_all(paths::digest_root(home.path())).unwrap();
        std::fs::write(
            paths::config_path(home.path()),
            "polling:\n  source_interval_secs: 0\n",
        )
        .unwrap();

        let err = load_at(home.path()).unwrap_err();
        assert!(
            matches!(
                err,
                ConfigError::Invalid {
                    field: "polling.source_interval_secs",
                    ..
                }
            ),
            "got: {err}"
        );
    }

    #[test]
    fn zero_concurrency_and_max_interval_are_rejected() {
        let mut polling = PollingSettings::default();
        polling.concurrency = 0;
        let err = polling.validate().unwrap_err();
        assert!(err.to_string().contains("polling.concurrency"), "got: {err}");

        let mut polling = PollingSettings::default();
        polling.max_interval_secs = 0;
        let err = polling.validate().unwrap_err();
        assert!(err.to_string().contains("polling.max_interval_secs"), "got: {err}");

        assert!(PollingSettings::default().validate().is_ok());
    }

    #[test]
    fn save_then_load_preserves_settings_and_cleans_tmp() {
        let home = TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.archive.lookback_days = 14;
        settings.log_format = LogFormat::Json;

        let path = save_at(home.path(), &settings).unwrap();
        assert!(!path.with_extension("yaml.tmp").exists());
        assert_eq!(load_at(home.path()).unwrap(), settings);
    }

    #[test]
    fn corrupt_yaml_reports_path() {
        let home = TempDir::new().unwrap();
        std::fs::create_dir_all(paths::digest_root(home.path())).unwrap();
        std::fs::write(paths::config_path(home.path()), "polling: [unclosed").unwrap();

        let err = load_at(home.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
        assert!(err.to_string().contains("config.yaml"));
    }

    #[test]
    fn env_overrides_replace_endpoints_and_secrets() {
        let vars: HashMap<&str, &str> = [
            ("DIGEST_READECK_TOKEN", "tok"),
            ("DIGEST_NOTEBOOK_URL", "http://notebook:5055"),
            ("DIGEST_DATABASE_PATH", "/data/state.db"),
            ("DIGEST_LOG_FORMAT", "JSON"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings
            .apply_env_with(|var| vars.get(var).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(settings.archive.token, "tok");
        assert_eq!(settings.notebook.url, "http://notebook:5055");
        assert_eq!(settings.ledger.path, Some(PathBuf::from("/data/state.db")));
        assert_eq!(settings.log_format, LogFormat::Json);
    }

    #[test]
    fn invalid_log_format_override_is_rejected() {
        let mut settings = Settings::default();
        let err = settings
            .apply_env_with(|var| (var == "DIGEST_LOG_FORMAT").then(|| "xml".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn stale_after_scales_expected_duration() {
        let settings = Settings::default();
        assert_eq!(
            settings.stale_after(),
            Duration::from_secs((300 + 600 + 600) * 3)
        );
    }
}
