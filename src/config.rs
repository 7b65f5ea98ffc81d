use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::logging::LogRotationPolicy;
use crate::monitor::MonitorIntervals;
use crate::process::ExitAction;
use crate::registry::RegistryOptions;

const SETTINGS_FILE: &str = "settings.toml";
const DEFAULT_PLAN_FILE: &str = "launch.toml";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub base_dir: PathBuf,
    pub log_dir: PathBuf,
    pub settings_path: PathBuf,
    pub default_plan_path: PathBuf,
    pub settings: Settings,
    /// Problems found while loading, reported once logging is up.
    pub load_warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub on_exit: OnExitSettings,
    pub monitor: MonitorSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnExitSettings {
    pub process_action: ExitAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub data_refresh_secs: f64,
    pub render_secs: f64,
    pub idle_sleep_ms: u64,
    pub restart_settle_ms: u64,
    pub stop_timeout_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            data_refresh_secs: 2.0,
            render_secs: 0.5,
            idle_sleep_ms: 20,
            restart_settle_ms: 1000,
            stop_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub log_rotation_days: u64,
    pub max_size_mb: u64,
    pub max_files: u32,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_rotation_days: 30,
            max_size_mb: 20,
            max_files: 5,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let base_dir = env::var("MAI_LAUNCHER_HOME")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_local_dir()
                    .unwrap_or_else(env::temp_dir)
                    .join("mai-launcher")
            });
        Self::load_from(base_dir)
    }

    pub fn load_from(base_dir: PathBuf) -> Result<Self> {
        let log_dir = base_dir.join("logs");
        let settings_path = base_dir.join(SETTINGS_FILE);
        let default_plan_path = base_dir.join(DEFAULT_PLAN_FILE);

        let mut config = Self {
            base_dir,
            log_dir,
            settings_path,
            default_plan_path,
            settings: Settings::default(),
            load_warnings: Vec::new(),
        };
        config.ensure_layout()?;

        let (settings, warnings) = load_settings(&config.settings_path)?;
        config.settings = settings;
        config.load_warnings = warnings;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("failed to create {}", self.base_dir.display()))?;
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("failed to create {}", self.log_dir.display()))?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(raw) = env::var("MAI_LAUNCHER_ON_EXIT") {
            match raw.parse::<ExitAction>() {
                Ok(action) => self.settings.on_exit.process_action = action,
                Err(err) => self
                    .load_warnings
                    .push(format!("ignoring MAI_LAUNCHER_ON_EXIT: {err}")),
            }
        }
        self.settings.logging.log_rotation_days = env_u64(
            "MAI_LAUNCHER_LOG_DAYS",
            self.settings.logging.log_rotation_days,
        );
    }

    pub fn monitor_intervals(&self) -> MonitorIntervals {
        let monitor = &self.settings.monitor;
        MonitorIntervals {
            data_refresh: secs_at_least(monitor.data_refresh_secs, 0.2),
            render: secs_at_least(monitor.render_secs, 0.05),
            idle_sleep: Duration::from_millis(monitor.idle_sleep_ms.clamp(5, 500)),
        }
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            log_dir: self.log_dir.clone(),
            log_rotation: self.log_rotation(),
            stop_timeout: Duration::from_secs(self.settings.monitor.stop_timeout_secs.max(1)),
            restart_settle: Duration::from_millis(self.settings.monitor.restart_settle_ms),
        }
    }

    pub fn log_rotation(&self) -> LogRotationPolicy {
        let logging = &self.settings.logging;
        LogRotationPolicy {
            max_size_bytes: logging.max_size_mb.max(1).saturating_mul(1024 * 1024),
            max_files: logging.max_files.max(1),
            max_age_days: logging.log_rotation_days,
        }
    }
}

fn load_settings(path: &Path) -> Result<(Settings, Vec<String>)> {
    if !path.exists() {
        let settings = Settings::default();
        save_settings(path, &settings)?;
        return Ok((settings, Vec::new()));
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file {}", path.display()))?;

    match toml::from_str::<Settings>(&content) {
        Ok(settings) => Ok((settings, Vec::new())),
        Err(error) => {
            let backup = corrupted_backup_path(path);
            let warning = match fs::rename(path, &backup) {
                Ok(()) => format!(
                    "settings file {} is invalid ({error}), moved to {}; using defaults",
                    path.display(),
                    backup.display()
                ),
                Err(rename_err) => format!(
                    "settings file {} is invalid ({error}) and could not be moved aside: {rename_err}; using defaults",
                    path.display()
                ),
            };
            Ok((Settings::default(), vec![warning]))
        }
    }
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let payload = toml::to_string_pretty(settings).context("failed to render settings")?;
    fs::write(path, payload).with_context(|| format!("failed to write {}", path.display()))
}

fn corrupted_backup_path(path: &Path) -> PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    PathBuf::from(format!("{}.corrupt-{suffix}", path.display()))
}

fn secs_at_least(value: f64, minimum: f64) -> Duration {
    if value.is_finite() && value > minimum {
        Duration::from_secs_f64(value)
    } else {
        Duration::from_secs_f64(minimum)
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
