use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_SETTINGS_REL_PATH: &str = "config/imagemill.settings.toml";
const ENV_PREFIX: &str = "IMAGEMILL_";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Wall-clock ceiling for one engine invocation, also passed as `-limit time`.
    pub engine_timeout_secs: u64,
    pub engine_memory_limit: String,
    /// Colon separated search path used both for probing the engine and as
    /// the child's `PATH`.
    pub engine_search_path: String,
    pub temp_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub jobs_db_path: PathBuf,
    pub queue_db_path: PathBuf,
    pub max_concurrent_jobs: usize,
    pub per_item_timeout_secs: u64,
    pub queue_retention_secs: u64,
    pub worker_poll_interval_ms: u64,
    pub blocking_pool_size: usize,
    pub default_output_format: String,
    pub default_quality: u8,
    pub preview_max_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            engine_timeout_secs: 180,
            engine_memory_limit: String::from("2GB"),
            engine_search_path: String::from("/usr/local/bin:/usr/bin:/bin"),
            temp_dir: PathBuf::from("/tmp/imagemill"),
            upload_dir: PathBuf::from("var/uploads"),
            processed_dir: PathBuf::from("var/processed"),
            jobs_db_path: PathBuf::from("var/backend/jobs.db"),
            queue_db_path: PathBuf::from("var/backend/queue.db"),
            max_concurrent_jobs: 10,
            per_item_timeout_secs: 60,
            queue_retention_secs: 86_400,
            worker_poll_interval_ms: 500,
            blocking_pool_size: 16,
            default_output_format: String::from("webp"),
            default_quality: 85,
            preview_max_size: 800,
        }
    }
}

impl Settings {
    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }

    pub fn per_item_timeout(&self) -> Duration {
        Duration::from_secs(self.per_item_timeout_secs)
    }

    pub fn queue_retention(&self) -> Duration {
        Duration::from_secs(self.queue_retention_secs)
    }

    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }

    /// Rebases every relative path onto `app_root`.
    pub fn resolve_paths(mut self, app_root: &Path) -> Self {
        for path in [
            &mut self.temp_dir,
            &mut self.upload_dir,
            &mut self.processed_dir,
            &mut self.jobs_db_path,
            &mut self.queue_db_path,
        ] {
            if path.is_relative() {
                *path = app_root.join(path.as_path());
            }
        }
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("failed to read settings '{path}': {message}")]
    ReadFile { path: String, message: String },
    #[error("failed to parse settings TOML '{path}': {message}")]
    ParseToml { path: String, message: String },
    #[error("environment override {key} has invalid value '{value}'")]
    InvalidEnv { key: String, value: String },
    #[error("setting '{field}' is out of range: {message}")]
    OutOfRange { field: &'static str, message: String },
}

pub fn default_app_root() -> PathBuf {
    std::env::var("IMAGEMILL_APP_ROOT")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Loads settings from an explicit file, falling back to
/// `config/imagemill.settings.toml` under `app_root`, then applies
/// `IMAGEMILL_*` environment overrides.
pub fn load_settings(app_root: &Path, explicit_path: Option<&str>) -> Result<Settings, SettingsError> {
    load_settings_with_env(app_root, explicit_path, |key| std::env::var(key).ok())
}

pub fn load_settings_with_env<F>(
    app_root: &Path,
    explicit_path: Option<&str>,
    env: F,
) -> Result<Settings, SettingsError>
where
    F: Fn(&str) -> Option<String>,
{
    let file_settings = match explicit_path
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .map(|p| if p.is_absolute() { p } else { app_root.join(p) })
    {
        Some(path) => load_settings_file(path.as_path())?,
        None => {
            let default_path = app_root.join(DEFAULT_SETTINGS_REL_PATH);
            if default_path.exists() {
                load_settings_file(default_path.as_path())?
            } else {
                Settings::default()
            }
        }
    };

    let settings = apply_env_overrides(file_settings, env)?;
    validate_settings(&settings)?;
    Ok(settings.resolve_paths(app_root))
}

fn load_settings_file(path: &Path) -> Result<Settings, SettingsError> {
    let raw = fs::read_to_string(path).map_err(|error| SettingsError::ReadFile {
        path: path.to_string_lossy().to_string(),
        message: error.to_string(),
    })?;
    parse_settings_toml(raw.as_str(), path)
}

fn parse_settings_toml(raw: &str, path: &Path) -> Result<Settings, SettingsError> {
    toml::from_str::<Settings>(raw).map_err(|error| SettingsError::ParseToml {
        path: path.to_string_lossy().to_string(),
        message: error.to_string(),
    })
}

fn apply_env_overrides<F>(mut settings: Settings, env: F) -> Result<Settings, SettingsError>
where
    F: Fn(&str) -> Option<String>,
{
    let lookup = |name: &str| {
        env(format!("{ENV_PREFIX}{name}").as_str())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    if let Some(v) = lookup("ENGINE_TIMEOUT_SECS") {
        settings.engine_timeout_secs = parse_env("ENGINE_TIMEOUT_SECS", v)?;
    }
    if let Some(v) = lookup("ENGINE_MEMORY_LIMIT") {
        settings.engine_memory_limit = v;
    }
    if let Some(v) = lookup("ENGINE_SEARCH_PATH") {
        settings.engine_search_path = v;
    }
    if let Some(v) = lookup("TEMP_DIR") {
        settings.temp_dir = PathBuf::from(v);
    }
    if let Some(v) = lookup("UPLOAD_DIR") {
        settings.upload_dir = PathBuf::from(v);
    }
    if let Some(v) = lookup("PROCESSED_DIR") {
        settings.processed_dir = PathBuf::from(v);
    }
    if let Some(v) = lookup("JOBS_DB") {
        settings.jobs_db_path = PathBuf::from(v);
    }
    if let Some(v) = lookup("QUEUE_DB") {
        settings.queue_db_path = PathBuf::from(v);
    }
    if let Some(v) = lookup("MAX_CONCURRENT_JOBS") {
        settings.max_concurrent_jobs = parse_env("MAX_CONCURRENT_JOBS", v)?;
    }
    if let Some(v) = lookup("PER_ITEM_TIMEOUT_SECS") {
        settings.per_item_timeout_secs = parse_env("PER_ITEM_TIMEOUT_SECS", v)?;
    }
    if let Some(v) = lookup("DEFAULT_OUTPUT_FORMAT") {
        settings.default_output_format = v.to_lowercase();
    }
    if let Some(v) = lookup("DEFAULT_QUALITY") {
        settings.default_quality = parse_env("DEFAULT_QUALITY", v)?;
    }
    Ok(settings)
}

fn parse_env<T: std::str::FromStr>(name: &str, value: String) -> Result<T, SettingsError> {
    value.parse::<T>().map_err(|_| SettingsError::InvalidEnv {
        key: format!("{ENV_PREFIX}{name}"),
        value,
    })
}

fn validate_settings(settings: &Settings) -> Result<(), SettingsError> {
    if settings.engine_timeout_secs == 0 {
        return Err(SettingsError::OutOfRange {
            field: "engine_timeout_secs",
            message: String::from("must be at least 1 second"),
        });
    }
    if settings.max_concurrent_jobs == 0 {
        return Err(SettingsError::OutOfRange {
            field: "max_concurrent_jobs",
            message: String::from("must be at least 1"),
        });
    }
    if !(1..=100).contains(&settings.default_quality) {
        return Err(SettingsError::OutOfRange {
            field: "default_quality",
            message: format!("{} is not within 1..=100", settings.default_quality),
        });
    }
    Ok(())
}
