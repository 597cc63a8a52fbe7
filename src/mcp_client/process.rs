//! OS process lookup and termination by process id (via `sysinfo`).
//!
//! Used for processes the supervisor knows only by a recorded pid, and to
//! send the graceful terminate signal to processes it holds a handle for.
//! A recorded pid is only acted on after [`process_matches`] confirms it
//! still belongs to the provider's launch command.

use std::path::Path;
use std::time::Duration;

use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, Signal, System};

/// Poll interval while waiting for a signalled process to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a terminate-by-pid request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// No such process existed.
    AlreadyGone,
    /// The process exited after the graceful signal.
    Terminated,
    /// The process had to be force-killed.
    Killed,
}

fn refreshed(pid: Pid) -> System {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys
}

fn is_live(process: &Process) -> bool {
    !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
}

fn base_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Whether a live process at `pid` was launched from `command_line`.
///
/// The program's file name must match the process's argv[0], executable or
/// name (`python` accepts `python3.11`), and every remaining token of
/// `command_line` must appear among its arguments. An empty command line
/// matches nothing.
pub fn process_matches(pid: u32, command_line: &str) -> bool {
    let mut expected = command_line.split_whitespace();
    let Some(program) = expected.next() else {
        return false;
    };
    let program = base_name(program);

    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::everything(),
    );
    let Some(process) = sys.process(pid).filter(|p| is_live(p)) else {
        return false;
    };

    let argv: Vec<String> = process
        .cmd()
        .iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();

    let mut launched_as = Vec::new();
    if let Some(first) = argv.first() {
        launched_as.push(base_name(first));
    }
    if let Some(exe) = process.exe() {
        launched_as.push(base_name(&exe.to_string_lossy()));
    }
    launched_as.push(process.name().to_string_lossy().into_owned());

    let program_matches = launched_as.iter().any(|n| n.starts_with(&program));
    program_matches && expected.all(|arg| argv.iter().skip(1).any(|a| a == arg))
}

/// Whether a live (non-zombie) process with this pid exists.
pub fn process_exists(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let sys = refreshed(pid);
    sys.process(pid).is_some_and(is_live)
}

/// Send the graceful terminate signal, falling back to a hard kill on
/// platforms without `SIGTERM`. Returns `false` if no such process exists.
pub fn signal_terminate(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let sys = refreshed(pid);
    match sys.process(pid) {
        Some(process) => process.kill_with(Signal::Term).unwrap_or_else(|| process.kill()),
        None => false,
    }
}

fn force_kill(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let sys = refreshed(pid);
    sys.process(pid).is_some_and(|p| p.kill())
}

/// Terminate a process by pid: graceful signal, bounded wait, then kill.
///
/// "No such process" is reported as [`TerminateOutcome::AlreadyGone`].
pub async fn terminate_pid(pid: u32, grace: Duration) -> TerminateOutcome {
    if !process_exists(pid) || !signal_terminate(pid) {
        return TerminateOutcome::AlreadyGone;
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !process_exists(pid) {
            return TerminateOutcome::Terminated;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }

    if force_kill(pid) {
        tracing::warn!(pid, "process ignored terminate signal, killed");
        TerminateOutcome::Killed
    } else {
        TerminateOutcome::Terminated
    }
}
