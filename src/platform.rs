//! OS-specific halves of the registry: spawning a detached component and
//! terminating a whole process tree.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io;
use std::process::Stdio;
use std::time::Duration;

use sysinfo::{Pid as SysPid, ProcessesToUpdate, Signal, System};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::debug;

use crate::process::LaunchSpec;

#[cfg(windows)]
const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;
#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Whether children write to per-component log files. On Windows each child
/// gets a console window of its own instead.
pub(crate) const CAPTURES_OUTPUT: bool = cfg!(not(windows));

/// Starts `spec.command` through the platform shell in its own session.
///
/// With `capture` the child's output goes to those files, never to the
/// launcher's terminal. On Unix the child leads a new session, so its process
/// group id equals its pid and the whole tree can be signalled at once.
pub(crate) fn spawn_detached(
    spec: &LaunchSpec,
    capture: Option<(File, File)>,
) -> io::Result<Child> {
    let mut command = shell_command(spec);
    command
        .current_dir(&spec.working_directory)
        .env("MAI_LAUNCHER_TITLE", &spec.title)
        .stdin(Stdio::null());
    match capture {
        Some((stdout, stderr)) => {
            command.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
        }
        // The shell line reattaches to its own console through CON.
        None => {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
    }
    command.spawn()
}

#[cfg(unix)]
fn shell_command(spec: &LaunchSpec) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(&spec.command);
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid()
                .map(|_| ())
                .map_err(io::Error::from)
        });
    }
    command
}

/// `cmd` in a new, visible console titled after the component. The inner
/// `cmd /k` keeps the window open after the command ends and reads and
/// writes that console directly.
#[cfg(windows)]
fn shell_command(spec: &LaunchSpec) -> Command {
    let mut command = Command::new("cmd");
    command
        .raw_arg(console_command_line(&spec.title, &spec.command))
        .creation_flags(CREATE_NEW_CONSOLE | CREATE_NEW_PROCESS_GROUP);
    command
}

#[cfg(any(windows, test))]
fn console_command_line(title: &str, command: &str) -> String {
    format!(
        "/d /s /c \"chcp 65001 >nul & title {} & cmd /d /s /k \"{command}\" <CON >CON 2>CON\"",
        escape_cmd_text(title)
    )
}

/// Escapes `cmd` metacharacters so `text` stays a plain argument.
#[cfg(any(windows, test))]
fn escape_cmd_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars().filter(|ch| *ch != '"' && *ch != '%') {
        if matches!(ch, '&' | '|' | '<' | '>' | '^' | '(' | ')') {
            escaped.push('^');
        }
        escaped.push(ch);
    }
    escaped
}

#[cfg(not(any(unix, windows)))]
fn shell_command(spec: &LaunchSpec) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(&spec.command);
    command
}

/// Total CPU time `pid` has consumed, read from `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
pub(crate) fn cpu_seconds(pid: u32) -> Option<f64> {
    use nix::unistd::{sysconf, SysconfVar};

    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may contain spaces or parentheses, so fields are
    // counted from the last ')'; utime and stime are fields 14 and 15.
    let fields: Vec<&str> = stat.rsplit_once(')')?.1.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let ticks_per_sec = sysconf(SysconfVar::CLK_TCK)
        .ok()
        .flatten()
        .filter(|ticks| *ticks > 0)
        .unwrap_or(100);
    Some((utime + stime) as f64 / ticks_per_sec as f64)
}

/// Elsewhere sysinfo's own per-refresh CPU figure is used.
#[cfg(not(target_os = "linux"))]
pub(crate) fn cpu_seconds(_pid: u32) -> Option<f64> {
    None
}

/// Waits up to `limit` for the child to be reaped.
pub(crate) async fn wait_for_exit(child: &mut Child, limit: Duration) -> bool {
    matches!(timeout(limit, child.wait()).await, Ok(Ok(_)))
}

pub(crate) fn has_exited(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(Some(_)))
}

/// Tree-aware termination: signal the child's process group, escalate to
/// SIGKILL once `grace` has passed.
#[cfg(unix)]
pub(crate) async fn terminate_tree(child: &mut Child, pid: u32, grace: Duration) -> Result<(), String> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal as UnixSignal};
    use nix::unistd::Pid;

    let os_pid = Pid::from_raw(pid as i32);

    match killpg(os_pid, UnixSignal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => match kill(os_pid, UnixSignal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(()),
            Err(err) => return Err(format!("SIGTERM to pid {pid} failed: {err}")),
        },
        Err(err) => return Err(format!("SIGTERM to process group {pid} failed: {err}")),
    }

    if wait_for_exit(child, grace).await {
        // The shell is gone; make sure nothing it left in the group survives.
        let _ = killpg(os_pid, UnixSignal::SIGKILL);
        return Ok(());
    }

    debug!("pid {pid} ignored SIGTERM for {grace:?}, escalating to SIGKILL");
    match killpg(os_pid, UnixSignal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => return Err(format!("SIGKILL to process group {pid} failed: {err}")),
    }
    if wait_for_exit(child, grace).await {
        Ok(())
    } else {
        Err(format!("pid {pid} still running after SIGKILL"))
    }
}

/// Kills whatever the exited session leader `pid` left in its process group.
#[cfg(unix)]
pub(crate) fn kill_leftover_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal as UnixSignal};
    use nix::unistd::Pid;

    if killpg(Pid::from_raw(pid as i32), UnixSignal::SIGKILL).is_ok() {
        debug!("killed leftover members of process group {pid}");
    }
}

/// `taskkill /T` already covers the tree on Windows.
#[cfg(not(unix))]
pub(crate) fn kill_leftover_group(_pid: u32) {}

/// Tree-aware termination through `taskkill /F /T`, bounded by `grace`.
#[cfg(windows)]
pub(crate) async fn terminate_tree(child: &mut Child, pid: u32, grace: Duration) -> Result<(), String> {
    let pid_string = pid.to_string();
    let limit = grace.max(Duration::from_secs(2));
    let status = timeout(
        limit,
        Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid_string])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .creation_flags(CREATE_NO_WINDOW)
            .status(),
    )
    .await
    .map_err(|_| format!("taskkill timed out after {limit:?}"))?
    .map_err(|err| format!("failed to run taskkill: {err}"))?;

    if wait_for_exit(child, grace).await {
        return Ok(());
    }
    if status.success() {
        Err(format!("pid {pid} still running after taskkill"))
    } else {
        Err(format!("taskkill exited with {status}"))
    }
}

#[cfg(not(any(unix, windows)))]
pub(crate) async fn terminate_tree(child: &mut Child, pid: u32, grace: Duration) -> Result<(), String> {
    child
        .start_kill()
        .map_err(|err| format!("failed to kill pid {pid}: {err}"))?;
    if wait_for_exit(child, grace).await {
        Ok(())
    } else {
        Err(format!("pid {pid} still running"))
    }
}

/// Fallback used when the tree-aware kill fails: enumerate descendants from
/// the OS process table, terminate each of them, then the parent.
pub(crate) async fn terminate_descendants(
    child: &mut Child,
    pid: u32,
    grace: Duration,
) -> Result<(), String> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let links: Vec<(u32, Option<u32>)> = system
        .processes()
        .iter()
        .map(|(child_pid, process)| (child_pid.as_u32(), process.parent().map(SysPid::as_u32)))
        .collect();

    for descendant in collect_descendants(pid, &links).into_iter().rev() {
        if let Some(process) = system.process(SysPid::from_u32(descendant)) {
            if !process.kill_with(Signal::Term).unwrap_or(false) {
                process.kill();
            }
        }
    }

    if has_exited(child) {
        return Ok(());
    }
    child
        .start_kill()
        .map_err(|err| format!("failed to kill pid {pid}: {err}"))?;
    if wait_for_exit(child, grace).await {
        Ok(())
    } else {
        Err(format!("pid {pid} still running after manual termination"))
    }
}

/// Breadth-first list of every process below `root`, closest first.
pub(crate) fn collect_descendants(root: u32, links: &[(u32, Option<u32>)]) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, parent) in links {
        if let Some(parent) = parent {
            if pid != parent {
                children.entry(*parent).or_default().push(*pid);
            }
        }
    }
    for list in children.values_mut() {
        list.sort_unstable();
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(current) = queue.pop_front() {
        let Some(direct) = children.get(&current) else {
            continue;
        };
        for pid in direct {
            if *pid != root && !found.contains(pid) {
                found.push(*pid);
                queue.push_back(*pid);
            }
        }
    }
    found
}
