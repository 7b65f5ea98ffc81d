use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tokio::process::Child;
use tracing::{error, info, warn};

use crate::errors::LauncherError;
use crate::logging::{open_log_writers, process_logs, LogRotationPolicy};
use crate::platform;
use crate::process::{LaunchSpec, ProcessHandle, StopAllReport};

/// How many stopped or exited PIDs are remembered for repeated `stop` calls.
const RETIRED_LIMIT: usize = 256;

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub log_dir: PathBuf,
    pub log_rotation: LogRotationPolicy,
    pub stop_timeout: Duration,
    pub restart_settle: Duration,
}

/// How a successful `stop` came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Terminated,
    AlreadyExited,
}

struct TrackedProcess {
    handle: ProcessHandle,
    child: Child,
}

/// The set of processes this launcher started and has not yet seen exit.
///
/// Only PIDs handed out by [`ProcessRegistry::start`] are ever signalled.
pub struct ProcessRegistry {
    options: RegistryOptions,
    processes: BTreeMap<u32, TrackedProcess>,
    retired: VecDeque<u32>,
}

impl ProcessRegistry {
    pub fn new(options: RegistryOptions) -> Self {
        Self {
            options,
            processes: BTreeMap::new(),
            retired: VecDeque::new(),
        }
    }

    pub fn start(&mut self, spec: LaunchSpec) -> Result<ProcessHandle, LauncherError> {
        validate_command(&spec.command)?;
        if spec.title.trim().is_empty() {
            return Err(LauncherError::InvalidCommand(
                "process title cannot be empty".to_string(),
            ));
        }
        if !spec.working_directory.is_dir() {
            return Err(LauncherError::Spawn {
                title: spec.title.clone(),
                source: io::Error::new(
                    io::ErrorKind::NotFound,
                    format!(
                        "working directory {} does not exist",
                        spec.working_directory.display()
                    ),
                ),
            });
        }

        let logs = platform::CAPTURES_OUTPUT
            .then(|| process_logs(&self.options.log_dir, &spec.title));
        let capture = logs
            .as_ref()
            .map(|logs| open_log_writers(logs, self.options.log_rotation))
            .transpose()
            .map_err(|err| LauncherError::Spawn {
                title: spec.title.clone(),
                source: io::Error::other(format!("{err:#}")),
            })?;

        let child = platform::spawn_detached(&spec, capture).map_err(|source| {
            LauncherError::Spawn {
                title: spec.title.clone(),
                source,
            }
        })?;
        let pid = child.id().ok_or_else(|| LauncherError::Spawn {
            title: spec.title.clone(),
            source: io::Error::other("process exited before its pid could be read"),
        })?;

        let handle = ProcessHandle {
            pid,
            title: spec.title,
            command: spec.command,
            working_directory: spec.working_directory,
            started_at: SystemTime::now(),
            logs,
        };

        info!(
            "started {} with command {:?} in {}",
            handle.target_label(),
            handle.command,
            handle.working_directory.display()
        );

        self.retired.retain(|retired| *retired != pid);
        let tracked = TrackedProcess {
            handle: handle.clone(),
            child,
        };
        if let Some(previous) = self.processes.insert(pid, tracked) {
            warn!(
                "pid {pid} was reused by the OS; dropping stale record for '{}'",
                previous.handle.title
            );
        }
        Ok(handle)
    }

    /// Prunes processes that have exited and returns the rest, ordered by PID.
    pub fn list_active(&mut self) -> Vec<ProcessHandle> {
        let mut exited = Vec::new();
        for (pid, tracked) in &mut self.processes {
            match tracked.child.try_wait() {
                Ok(Some(status)) => {
                    info!("{} exited with {status}", tracked.handle.target_label());
                    exited.push(*pid);
                }
                Ok(None) => {}
                Err(err) => warn!(
                    "failed to poll {}: {err}",
                    tracked.handle.target_label()
                ),
            }
        }
        for pid in exited {
            self.processes.remove(&pid);
            self.retire(pid);
        }

        self.processes
            .values()
            .map(|tracked| tracked.handle.clone())
            .collect()
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessHandle> {
        self.processes.get(&pid).map(|tracked| &tracked.handle)
    }

    pub fn tracked_pids(&self) -> Vec<u32> {
        self.processes.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Terminates `pid` together with its descendants.
    ///
    /// The record is dropped whatever the outcome. A PID this registry once
    /// started but has since lost reports `AlreadyExited` without touching the
    /// OS; any other unknown PID is refused.
    pub async fn stop(&mut self, pid: u32) -> Result<StopOutcome, LauncherError> {
        let Some(mut tracked) = self.processes.remove(&pid) else {
            if self.retired.contains(&pid) {
                return Ok(StopOutcome::AlreadyExited);
            }
            warn!("refusing to stop pid {pid}: not started by this launcher");
            return Err(LauncherError::NotTracked(pid));
        };
        self.retire(pid);

        let label = tracked.handle.target_label();
        if platform::has_exited(&mut tracked.child) {
            info!("{label} had already exited");
            platform::kill_leftover_group(pid);
            return Ok(StopOutcome::AlreadyExited);
        }

        info!("stopping {label}");
        let grace = self.options.stop_timeout;
        match platform::terminate_tree(&mut tracked.child, pid, grace).await {
            Ok(()) => {
                info!("stopped {label}");
                return Ok(StopOutcome::Terminated);
            }
            Err(reason) => warn!("tree kill failed for {label}: {reason}; terminating descendants manually"),
        }

        match platform::terminate_descendants(&mut tracked.child, pid, grace).await {
            Ok(()) => {
                info!("stopped {label} after manual descendant termination");
                Ok(StopOutcome::Terminated)
            }
            Err(reason) => {
                error!("could not stop {label}: {reason}; it may need to be closed with OS tools");
                Err(LauncherError::TerminationFailed { pid, reason })
            }
        }
    }

    pub async fn stop_all(&mut self) -> StopAllReport {
        let mut report = StopAllReport::default();
        for pid in self.tracked_pids() {
            let result = self.stop(pid).await;
            report.record(&result);
        }
        info!(
            "stop_all finished: {} stopped, {} failed",
            report.stopped, report.failed
        );
        report
    }

    /// Stops `pid`, waits for the settle delay, then starts the same command
    /// again. The returned handle carries the new PID.
    pub async fn restart(&mut self, pid: u32) -> Result<ProcessHandle, LauncherError> {
        let spec = self
            .get(pid)
            .map(ProcessHandle::launch_spec)
            .ok_or(LauncherError::NotTracked(pid))?;

        info!("restarting '{}' (PID {pid})", spec.title);
        self.stop(pid).await?;
        tokio::time::sleep(self.options.restart_settle).await;
        let handle = self.start(spec)?;
        info!("restarted '{}': PID {pid} -> {}", handle.title, handle.pid);
        Ok(handle)
    }

    fn retire(&mut self, pid: u32) {
        if !self.retired.contains(&pid) {
            self.retired.push_back(pid);
        }
        while self.retired.len() > RETIRED_LIMIT {
            self.retired.pop_front();
        }
    }
}

impl StopAllReport {
    fn record(&mut self, result: &Result<StopOutcome, LauncherError>) {
        match result {
            Ok(_) => self.stopped += 1,
            Err(err) => {
                warn!("stop_all: {err}");
                self.failed += 1;
            }
        }
    }
}

pub fn validate_command(command: &str) -> Result<(), LauncherError> {
    let parts = shell_words::split(command)
        .map_err(|err| LauncherError::InvalidCommand(format!("{command:?}: {err}")))?;
    if parts.is_empty() {
        return Err(LauncherError::InvalidCommand(
            "command cannot be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::{Path, PathBuf};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use sysinfo::{Pid as SysPid, ProcessStatus, ProcessesToUpdate, System};

    use super::{
        validate_command, ProcessRegistry, RegistryOptions, StopOutcome, RETIRED_LIMIT,
    };
    use crate::command::{parse, ParsedCommand};
    use crate::errors::LauncherError;
    use crate::logging::LogRotationPolicy;
    use crate::process::{LaunchSpec, StopAllReport};

    fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock failure")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("mai-launcher-{prefix}-{nonce}"));
        std::fs::create_dir_all(&dir).expect("failed to create temp dir");
        dir
    }

    fn registry(dir: &Path) -> ProcessRegistry {
        ProcessRegistry::new(RegistryOptions {
            log_dir: dir.join("logs"),
            log_rotation: LogRotationPolicy {
                max_size_bytes: 1024 * 1024,
                max_files: 2,
                max_age_days: 1,
            },
            stop_timeout: Duration::from_secs(2),
            restart_settle: Duration::from_millis(20),
        })
    }

    fn sleeper(dir: &Path, title: &str) -> LaunchSpec {
        LaunchSpec::new("sleep 30", dir, title)
    }

    fn is_running(pid: u32) -> bool {
        let mut system = System::new();
        let sys_pid = SysPid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
        system
            .process(sys_pid)
            .map(|process| !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
            .unwrap_or(false)
    }

    async fn wait_until_gone(pid: u32) -> bool {
        for _ in 0..60 {
            if !is_running(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    fn child_pids_of(pid: u32) -> Vec<u32> {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        system
            .processes()
            .iter()
            .filter(|(_, process)| process.parent() == Some(SysPid::from_u32(pid)))
            .map(|(child, _)| child.as_u32())
            .collect()
    }

    #[tokio::test]
    async fn start_tracks_each_process_once() {
        let dir = temp_dir("registry-unique");
        let mut registry = registry(&dir);

        let first = registry.start(sleeper(&dir, "first")).expect("start first");
        let second = registry.start(sleeper(&dir, "second")).expect("start second");
        let third = registry.start(sleeper(&dir, "third")).expect("start third");

        let active = registry.list_active();
        let pids: Vec<u32> = active.iter().map(|handle| handle.pid).collect();
        assert_eq!(active.len(), 3);
        assert!(pids.contains(&first.pid));
        assert!(pids.contains(&second.pid));
        assert!(pids.contains(&third.pid));
        assert!(pids.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(first.logs.is_some());

        let report = registry.stop_all().await;
        assert_eq!(report.stopped, 3);
        assert_eq!(report.failed, 0);
        assert!(registry.is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn untracked_pid_is_refused() {
        let dir = temp_dir("registry-untracked");
        let mut registry = registry(&dir);
        let own_pid = std::process::id();

        assert!(matches!(
            registry.stop(own_pid).await,
            Err(LauncherError::NotTracked(pid)) if pid == own_pid
        ));
        assert!(matches!(
            registry.restart(1).await,
            Err(LauncherError::NotTracked(1))
        ));
        assert!(registry.is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn stopping_twice_reports_already_exited() {
        let dir = temp_dir("registry-twice");
        let mut registry = registry(&dir);
        let handle = registry.start(sleeper(&dir, "twice")).expect("start");

        assert_eq!(
            registry.stop(handle.pid).await.expect("first stop"),
            StopOutcome::Terminated
        );
        assert!(registry.get(handle.pid).is_none());
        assert_eq!(
            registry.stop(handle.pid).await.expect("second stop"),
            StopOutcome::AlreadyExited
        );
        assert!(wait_until_gone(handle.pid).await);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn restart_keeps_launch_spec_and_replaces_pid() {
        let dir = temp_dir("registry-restart");
        let mut registry = registry(&dir);
        let original = registry.start(sleeper(&dir, "worker")).expect("start");

        let restarted = registry.restart(original.pid).await.expect("restart");

        assert_ne!(restarted.pid, original.pid);
        assert_eq!(restarted.launch_spec(), original.launch_spec());
        assert!(registry.get(original.pid).is_none());
        assert_eq!(registry.tracked_pids(), vec![restarted.pid]);

        registry.stop_all().await;
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn exited_processes_are_pruned_by_list_active() {
        let dir = temp_dir("registry-exit");
        let mut registry = registry(&dir);
        let handle = registry
            .start(LaunchSpec::new("exit 0", &dir, "short"))
            .expect("start");

        let mut pruned = false;
        for _ in 0..100 {
            if registry.list_active().is_empty() {
                pruned = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(pruned);
        assert_eq!(
            registry.stop(handle.pid).await.expect("stop after exit"),
            StopOutcome::AlreadyExited
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn stop_takes_down_grandchildren() {
        let dir = temp_dir("registry-tree");
        let mut registry = registry(&dir);
        let handle = registry
            .start(LaunchSpec::new("sleep 30 & sleep 30 & wait", &dir, "tree"))
            .expect("start");

        let mut children = Vec::new();
        for _ in 0..40 {
            children = child_pids_of(handle.pid);
            if children.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(children.len() >= 2, "shell never forked its children");

        registry.stop(handle.pid).await.expect("stop tree");

        for pid in children {
            assert!(wait_until_gone(pid).await, "grandchild {pid} survived");
        }
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn two_components_stop_independently() {
        let dir = temp_dir("registry-pair");
        let mut registry = registry(&dir);
        let a = registry.start(sleeper(&dir, "A")).expect("start A");
        let b = registry.start(sleeper(&dir, "B")).expect("start B");
        assert_eq!(registry.list_active().len(), 2);

        registry.stop(a.pid).await.expect("stop A");

        let remaining = registry.list_active();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].pid, b.pid);
        assert_eq!(remaining[0].title, "B");
        assert!(wait_until_gone(a.pid).await);

        registry.stop_all().await;
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn restart_of_unknown_pid_leaves_registry_untouched() {
        let dir = temp_dir("registry-unknown-restart");
        let mut registry = registry(&dir);
        let handle = registry.start(sleeper(&dir, "only")).expect("start");
        let unknown = if handle.pid == 9999 { 9998 } else { 9999 };

        assert_eq!(
            parse(&format!("restart {unknown}")),
            ParsedCommand::Restart(unknown)
        );
        assert!(matches!(
            registry.restart(unknown).await,
            Err(LauncherError::NotTracked(pid)) if pid == unknown
        ));
        assert_eq!(registry.tracked_pids(), vec![handle.pid]);

        registry.stop_all().await;
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn failed_start_records_nothing() {
        let dir = temp_dir("registry-failed-start");
        let mut registry = registry(&dir);

        let missing_dir = registry.start(LaunchSpec::new("sleep 1", dir.join("missing"), "ghost"));
        assert!(matches!(missing_dir, Err(LauncherError::Spawn { .. })));
        assert!(matches!(
            registry.start(LaunchSpec::new("   ", &dir, "blank")),
            Err(LauncherError::InvalidCommand(_))
        ));
        assert!(matches!(
            registry.start(LaunchSpec::new("echo 'unterminated", &dir, "quote")),
            Err(LauncherError::InvalidCommand(_))
        ));
        assert!(registry.is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn stopping_an_exited_leader_kills_its_leftover_group() {
        let dir = temp_dir("registry-leftover");
        let mut registry = registry(&dir);
        let handle = registry
            .start(LaunchSpec::new(
                "sleep 30 & echo $! > leftover.pid; exit 0",
                &dir,
                "leftover",
            ))
            .expect("start");

        let mut leftover = None;
        for _ in 0..60 {
            leftover = std::fs::read_to_string(dir.join("leftover.pid"))
                .ok()
                .and_then(|text| text.trim().parse::<u32>().ok());
            if leftover.is_some() && !is_running(handle.pid) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let leftover = leftover.expect("shell never reported its background job");
        assert!(is_running(leftover));

        assert_eq!(
            registry.stop(handle.pid).await.expect("stop"),
            StopOutcome::AlreadyExited
        );
        assert!(wait_until_gone(leftover).await, "background job {leftover} survived");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn oldest_retired_pids_are_forgotten() {
        let dir = temp_dir("registry-retired");
        let mut registry = registry(&dir);
        let base = 3_000_000_000u32;
        for offset in 0..=RETIRED_LIMIT as u32 {
            registry.retire(base + offset);
        }

        assert!(matches!(
            registry.stop(base).await,
            Err(LauncherError::NotTracked(pid)) if pid == base
        ));
        assert_eq!(
            registry
                .stop(base + RETIRED_LIMIT as u32)
                .await
                .expect("recent pid"),
            StopOutcome::AlreadyExited
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn stop_all_report_counts_failures_without_stopping_early() {
        let mut report = StopAllReport::default();
        report.record(&Ok(StopOutcome::Terminated));
        report.record(&Err(LauncherError::TerminationFailed {
            pid: 42,
            reason: "still running after SIGKILL".to_string(),
        }));
        report.record(&Ok(StopOutcome::AlreadyExited));

        assert_eq!(report.stopped, 2);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn stop_all_covers_exited_and_running_components() {
        let dir = temp_dir("registry-stop-all-mixed");
        let mut registry = registry(&dir);
        let quick = registry
            .start(LaunchSpec::new("exit 0", &dir, "quick"))
            .expect("start quick");
        let slow = registry.start(sleeper(&dir, "slow")).expect("start slow");
        assert!(wait_until_gone(quick.pid).await);

        let report = registry.stop_all().await;

        assert_eq!(report.stopped, 2);
        assert_eq!(report.failed, 0);
        assert!(registry.is_empty());
        assert!(wait_until_gone(slow.pid).await);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn validate_command_accepts_quoted_arguments() {
        assert!(validate_command("python3 \"bot main.py\" --port 8080").is_ok());
        assert!(validate_command("").is_err());
    }
}
