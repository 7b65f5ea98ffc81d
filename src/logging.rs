use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

const LAUNCHER_LOG_PREFIX: &str = "launcher-";
const LAUNCHER_LOG_SUFFIX: &str = ".log";

/// Captured stdout/stderr files of one detached component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessLogs {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRotationPolicy {
    pub max_size_bytes: u64,
    pub max_files: u32,
    pub max_age_days: u64,
}

/// Installs the global tracing subscriber, writing to a fresh launcher log file.
///
/// The terminal belongs to the status monitor, so nothing is logged to stdout or
/// stderr. Returns the path of the file that receives this session's log lines.
pub fn init_tracing(log_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;

    let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
    let path = log_dir.join(format!("{LAUNCHER_LOG_PREFIX}{stamp}{LAUNCHER_LOG_SUFFIX}"));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed opening {}", path.display()))?;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install log subscriber: {err}"))?;

    Ok(path)
}

/// Deletes `launcher-*.log` session files not modified within `retention_days`.
/// Returns how many files were removed.
pub fn prune_launcher_logs(log_dir: &Path, retention_days: u64) -> Result<usize> {
    if retention_days == 0 || !log_dir.is_dir() {
        return Ok(0);
    }

    let limit = days(retention_days);
    let listing = fs::read_dir(log_dir)
        .with_context(|| format!("failed to list {}", log_dir.display()))?;
    let removed = listing
        .flatten()
        .filter(|entry| {
            entry.file_name().to_str().is_some_and(|name| {
                name.starts_with(LAUNCHER_LOG_PREFIX) && name.ends_with(LAUNCHER_LOG_SUFFIX)
            })
        })
        .filter(|entry| age_of(entry).is_some_and(|age| age > limit))
        .filter(|entry| fs::remove_file(entry.path()).is_ok())
        .count();
    Ok(removed)
}

pub fn process_logs(log_dir: &Path, title: &str) -> ProcessLogs {
    let slug = log_slug(title);
    ProcessLogs {
        stdout: log_dir.join(format!("{slug}.out.log")),
        stderr: log_dir.join(format!("{slug}.err.log")),
    }
}

/// Opens both capture files for appending, rotating and pruning old
/// generations first.
pub fn open_log_writers(logs: &ProcessLogs, policy: LogRotationPolicy) -> Result<(File, File)> {
    if let Some(parent) = logs.stdout.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    for path in [&logs.stdout, &logs.stderr] {
        shift_generations(path, policy)?;
        prune_generations(path, policy)?;
    }
    Ok((open_append(&logs.stdout)?, open_append(&logs.stderr)?))
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed opening {}", path.display()))
}

/// Lowercased title with every run of separators collapsed to one `-`.
fn log_slug(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for ch in title.chars() {
        if ch.is_alphanumeric() || ch == '_' {
            slug.extend(ch.to_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        "process".to_string()
    } else {
        slug
    }
}

/// Moves a capture file that reached `max_size_bytes` to `<file>.1`, pushing
/// older generations one step back and dropping the one past `max_files`.
fn shift_generations(path: &Path, policy: LogRotationPolicy) -> Result<()> {
    if policy.max_size_bytes == 0 || policy.max_files == 0 {
        return Ok(());
    }
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", path.display()));
        }
    };
    if size < policy.max_size_bytes {
        return Ok(());
    }

    let _ = fs::remove_file(generation_path(path, policy.max_files));
    for generation in (1..policy.max_files).rev() {
        let from = generation_path(path, generation);
        if !from.exists() {
            continue;
        }
        let to = generation_path(path, generation + 1);
        fs::rename(&from, &to)
            .with_context(|| format!("failed to move {} to {}", from.display(), to.display()))?;
    }
    let first = generation_path(path, 1);
    fs::rename(path, &first)
        .with_context(|| format!("failed to move {} to {}", path.display(), first.display()))
}

/// Removes generations numbered past `max_files`, and those older than
/// `max_age_days` when that limit is set.
fn prune_generations(path: &Path, policy: LogRotationPolicy) -> Result<()> {
    let (Some(dir), Some(stem)) = (path.parent(), path.file_name().and_then(OsStr::to_str)) else {
        return Ok(());
    };
    let max_age = (policy.max_age_days > 0).then(|| days(policy.max_age_days));

    let listing =
        fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    for entry in listing.flatten() {
        let Some(generation) = entry
            .file_name()
            .to_str()
            .and_then(|name| generation_of(name, stem))
        else {
            continue;
        };
        let expired =
            max_age.is_some_and(|limit| age_of(&entry).is_some_and(|age| age > limit));
        if generation > policy.max_files || expired {
            let _ = fs::remove_file(entry.path());
        }
    }
    Ok(())
}

/// `Some(3)` for `core.out.log.3` given stem `core.out.log`.
fn generation_of(file_name: &str, stem: &str) -> Option<u32> {
    file_name.strip_prefix(stem)?.strip_prefix('.')?.parse().ok()
}

fn generation_path(path: &Path, generation: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}

fn age_of(entry: &fs::DirEntry) -> Option<Duration> {
    let modified = entry.metadata().ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

fn days(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(24 * 60 * 60))
}
