use std::collections::HashMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use chrono::{Local, TimeZone};
use sysinfo::{Pid as SysPid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::platform::cpu_seconds;
use crate::process::{MetricsSample, ProcessDetails, ProcessHandle};
use crate::ui::format_uptime;

/// Reads CPU, memory and uptime for live PIDs.
///
/// CPU usage is the CPU time consumed between two samples divided by the wall
/// time between them, so the first reading for a PID is always `0.0`. A PID
/// stays primed until it is forgotten or the OS hands the same number to a
/// process with a different start time.
pub struct MetricsSampler {
    system: System,
    primed: HashMap<u32, CpuMark>,
}

/// What the previous sample of one PID saw.
#[derive(Debug, Clone, Copy)]
struct CpuMark {
    start_time: u64,
    cpu_secs: Option<f64>,
    taken_at: Instant,
}

impl CpuMark {
    /// Percent of one core used since `self`; `None` when CPU time is not
    /// readable on this platform.
    fn percent_until(&self, later: &CpuMark) -> Option<f32> {
        let used = later.cpu_secs? - self.cpu_secs?;
        let elapsed = later.taken_at.duration_since(self.taken_at).as_secs_f64();
        if elapsed <= 0.0 {
            return Some(0.0);
        }
        Some((used.max(0.0) / elapsed * 100.0) as f32)
    }
}

impl Default for MetricsSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            primed: HashMap::new(),
        }
    }

    /// `None` when the PID no longer exists.
    pub fn sample(&mut self, pid: u32) -> Option<MetricsSample> {
        self.sample_many(&[pid]).into_iter().next().and_then(|(_, sample)| sample)
    }

    /// Samples several PIDs with a single process-table refresh.
    pub fn sample_many(&mut self, pids: &[u32]) -> Vec<(u32, Option<MetricsSample>)> {
        if pids.is_empty() {
            return Vec::new();
        }
        let sys_pids: Vec<SysPid> = pids.iter().copied().map(SysPid::from_u32).collect();
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&sys_pids), true);

        let now = now_epoch_secs_f64();
        pids.iter()
            .map(|pid| {
                let Some(process) = self.system.process(SysPid::from_u32(*pid)) else {
                    self.primed.remove(pid);
                    return (*pid, None);
                };
                let mark = CpuMark {
                    start_time: process.start_time(),
                    cpu_secs: cpu_seconds(*pid),
                    taken_at: Instant::now(),
                };
                let cpu_percent = match self.primed.insert(*pid, mark) {
                    Some(previous) if previous.start_time == mark.start_time => previous
                        .percent_until(&mark)
                        .unwrap_or_else(|| process.cpu_usage().max(0.0)),
                    _ => 0.0,
                };
                let sample = MetricsSample {
                    cpu_percent,
                    memory_mb: process.memory() as f64 / (1024.0 * 1024.0),
                    uptime_secs: (now - mark.start_time as f64).max(0.0),
                };
                (*pid, Some(sample))
            })
            .collect()
    }

    pub fn forget(&mut self, pid: u32) {
        self.primed.remove(&pid);
    }

    /// Forgets every PID not in `live`.
    pub fn retain(&mut self, live: &[u32]) {
        self.primed.retain(|pid, _| live.contains(pid));
    }

    #[cfg(test)]
    pub fn is_primed(&self, pid: u32) -> bool {
        self.primed.contains_key(&pid)
    }

    /// Full snapshot for the details screen; `None` when the PID is gone.
    pub fn details(&mut self, pid: u32, handle: Option<&ProcessHandle>) -> Option<ProcessDetails> {
        let sys_pid = SysPid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::everything(),
        );
        let process = self.system.process(sys_pid)?;

        let mut details = ProcessDetails {
            pid,
            ..ProcessDetails::default()
        };
        details.push("PID", pid.to_string());
        details.push("Name", process.name().to_string_lossy());
        details.push("Status", process.status().to_string());
        details.push(
            "Memory",
            format!("{:.2} MB", process.memory() as f64 / (1024.0 * 1024.0)),
        );
        details.push("Started", format_start_time(process.start_time()));
        details.push(
            "Uptime",
            format_uptime(now_epoch_secs_f64() - process.start_time() as f64),
        );
        let cmdline = process
            .cmd()
            .iter()
            .map(|part| part.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        details.push("Command line", or_dash(cmdline));
        details.push(
            "Working directory",
            process
                .cwd()
                .map(|cwd| cwd.display().to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
        details.push(
            "Parent PID",
            process
                .parent()
                .map(|parent| parent.as_u32().to_string())
                .unwrap_or_else(|| "-".to_string()),
        );

        match handle {
            Some(handle) => {
                details.push("Managed title", handle.title.clone());
                details.push("Launch command", handle.command.clone());
                details.push(
                    "Tracked for",
                    format_uptime(handle.tracked_for().as_secs_f64()),
                );
                if let Some(logs) = &handle.logs {
                    details.push("Stdout log", logs.stdout.display().to_string());
                    details.push("Stderr log", logs.stderr.display().to_string());
                }
            }
            None => details.push("Managed title", "mai-launcher"),
        }

        Some(details)
    }
}

fn format_start_time(epoch_secs: u64) -> String {
    i64::try_from(epoch_secs)
        .ok()
        .and_then(|secs| Local.timestamp_opt(secs, 0).single())
        .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn or_dash(value: String) -> String {
    if value.trim().is_empty() {
        "-".to_string()
    } else {
        value
    }
}

fn now_epoch_secs_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or(0.0)
}
