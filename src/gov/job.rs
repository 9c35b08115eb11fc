//! Job model and the spawn/inspect capabilities injected into the runner.
//!
//! A job owns the read ends of its stdout/stderr pipes; they are acquired at
//! spawn and closed on every terminal transition, including failure to spawn.

use anyhow::Context as _;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{setsid, Pid};
use std::collections::HashMap;
use std::fs;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt as _;
use std::process::{Child, Command, Stdio};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobLimits {
    pub max_runtime_ms: u64,
    pub max_log_bytes: u64,
    pub max_output_line_bytes: u64,
    pub max_child_processes: i32,
}

impl Default for JobLimits {
    fn default() -> Self {
        Self {
            max_runtime_ms: 600_000,
            max_log_bytes: 10 * 1024 * 1024,
            max_output_line_bytes: 64 * 1024,
            max_child_processes: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    ProcLimit,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Timeout => "TIMEOUT",
            JobStatus::ProcLimit => "PROC_LIMIT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

#[derive(Debug)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub status: JobStatus,
    pub exit_code: i32,
    pub output: Vec<u8>,
    pub error: Vec<u8>,
    pub bytes_written: u64,
    pub log_truncated: bool,
    pub created_at_ms: u64,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub last_scanned_at_ms: u64,
    pub pgid: i32,
    pub kill_signal_sent: bool,
    pub sigterm_sent_at_ms: u64,
    pub sigkill_sent: bool,
    pub limits: JobLimits,
    pub stdout_pipe: Option<OwnedFd>,
    pub stderr_pipe: Option<OwnedFd>,
}

impl Job {
    pub fn new(id: String, command: String, limits: JobLimits, created_at_ms: u64) -> Self {
        Self {
            id,
            command,
            status: JobStatus::Pending,
            exit_code: -1,
            output: Vec::new(),
            error: Vec::new(),
            bytes_written: 0,
            log_truncated: false,
            created_at_ms,
            started_at_ms: 0,
            finished_at_ms: 0,
            last_scanned_at_ms: 0,
            pgid: -1,
            kill_signal_sent: false,
            sigterm_sent_at_ms: 0,
            sigkill_sent: false,
            limits,
            stdout_pipe: None,
            stderr_pipe: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn close_pipes(&mut self) {
        self.stdout_pipe = None;
        self.stderr_pipe = None;
    }
}

/// Handles returned by a successful spawn. `pgid` leads the new process
/// group; the pipes are already non-blocking.
#[derive(Debug)]
pub struct SpawnedJob {
    pub pgid: i32,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

/// Capability trait: how jobs get started, reaped and signalled. The runner
/// only ever talks to this interface, so tests drive it with a fake.
pub trait JobSpawner: Send {
    fn spawn_job(&mut self, command: &str) -> anyhow::Result<SpawnedJob>;
    /// Non-blocking completion check; Some(exit_code) once the group leader
    /// has been reaped.
    fn try_wait(&mut self, pgid: i32) -> Option<i32>;
    fn kill_group(&mut self, pgid: i32, signal: Signal);
}

/// Capability trait: how many processes currently live in a process group.
pub trait ProcessInspector: Send {
    /// -1 when the count cannot be determined.
    fn count_in_pgid(&mut self, pgid: i32) -> i32;
}

fn set_nonblocking(fd: &OwnedFd) -> anyhow::Result<()> {
    // SAFETY: fcntl on an owned, open fd.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        anyhow::bail!("F_GETFL failed: {}", std::io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        anyhow::bail!("F_SETFL failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

/// Append everything currently readable from a non-blocking pipe. Returns the
/// byte count appended; stops on EOF or EAGAIN.
pub fn drain_pipe(fd: &OwnedFd, buf: &mut Vec<u8>) -> u64 {
    let mut chunk = [0u8; 4096];
    let mut total = 0u64;
    loop {
        // SAFETY: reading into a stack buffer from an open fd.
        let n = unsafe {
            libc::read(
                fd.as_raw_fd(),
                chunk.as_mut_ptr() as *mut libc::c_void,
                chunk.len(),
            )
        };
        if n <= 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n as usize]);
        total += n as u64;
    }
    total
}

/// Production spawner: `sh -c <command>` in its own session/process group
/// with piped, non-blocking stdout/stderr.
#[derive(Default)]
pub struct ShellSpawner {
    children: HashMap<i32, Child>,
}

impl ShellSpawner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobSpawner for ShellSpawner {
    fn spawn_job(&mut self, command: &str) -> anyhow::Result<SpawnedJob> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // The child becomes its own session and process-group leader so the
        // whole tree can be signalled via kill(-pgid).
        unsafe {
            cmd.pre_exec(|| {
                setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn job command: {command}"))?;
        let pgid = child.id() as i32;

        let stdout: Option<OwnedFd> = child.stdout.take().map(OwnedFd::from);
        let stderr: Option<OwnedFd> = child.stderr.take().map(OwnedFd::from);
        for fd in [&stdout, &stderr].into_iter().flatten() {
            set_nonblocking(fd)?;
        }

        self.children.insert(pgid, child);
        Ok(SpawnedJob {
            pgid,
            stdout,
            stderr,
        })
    }

    fn try_wait(&mut self, pgid: i32) -> Option<i32> {
        let child = self.children.get_mut(&pgid)?;
        match child.try_wait() {
            Ok(Some(status)) => {
                self.children.remove(&pgid);
                Some(status.code().unwrap_or(-1))
            }
            Ok(None) => None,
            Err(_) => {
                // The child is gone in a way we cannot reap; treat as failed.
                self.children.remove(&pgid);
                Some(-1)
            }
        }
    }

    fn kill_group(&mut self, pgid: i32, signal: Signal) {
        if pgid <= 0 {
            return;
        }
        let _ = kill(Pid::from_raw(-pgid), signal);
    }
}

/// Counts pgid members by scanning /proc/<pid>/stat (pgrp is field 5).
/// Bounded to 5000 entries per scan to keep tick cost predictable.
#[derive(Default)]
pub struct ProcfsInspector;

const MAX_PROC_SCANS: usize = 5000;

pub(crate) fn parse_pgrp_from_stat_line(line: &str) -> Option<i32> {
    let after_comm = &line[line.rfind(')')? + 1..];
    // Fields after comm: state ppid pgrp ...
    after_comm
        .split_whitespace()
        .nth(2)
        .and_then(|tok| tok.parse().ok())
}

impl ProcessInspector for ProcfsInspector {
    fn count_in_pgid(&mut self, pgid: i32) -> i32 {
        let Ok(entries) = fs::read_dir("/proc") else {
            return -1;
        };
        let mut count = 0;
        let mut scanned = 0;
        for entry in entries.flatten() {
            if scanned >= MAX_PROC_SCANS {
                break;
            }
            let name = entry.file_name();
            let Some(pid_str) = name.to_str() else {
                continue;
            };
            if !pid_str.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            scanned += 1;
            let Ok(line) = fs::read_to_string(entry.path().join("stat")) else {
                continue;
            };
            if parse_pgrp_from_stat_line(&line) == Some(pgid) {
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_defaults() {
        let limits = JobLimits::default();
        assert_eq!(limits.max_runtime_ms, 600_000);
        assert_eq!(limits.max_log_bytes, 10 * 1024 * 1024);
        assert_eq!(limits.max_child_processes, 64);
    }

    #[test]
    fn status_terminality() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        for s in [
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::Timeout,
            JobStatus::ProcLimit,
        ] {
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn parses_pgrp_field() {
        let line = "42 (some proc) S 1 4242 42 0 -1 4194304 0 0 0 0 0 0 0 0 20 0 1 0 99 0 0";
        assert_eq!(parse_pgrp_from_stat_line(line), Some(4242));
        assert_eq!(parse_pgrp_from_stat_line("garbage"), None);
    }

    #[test]
    fn shell_spawner_runs_and_reaps() {
        let mut spawner = ShellSpawner::new();
        let spawned = spawner.spawn_job("echo hello").unwrap();
        assert!(spawned.pgid > 0);
        assert!(spawned.stdout.is_some());

        // Poll until the child is reaped; echo exits almost immediately.
        let mut code = None;
        for _ in 0..500 {
            code = spawner.try_wait(spawned.pgid);
            if code.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(code, Some(0));

        let mut out = Vec::new();
        drain_pipe(spawned.stdout.as_ref().unwrap(), &mut out);
        assert_eq!(String::from_utf8_lossy(&out).trim(), "hello");
    }

    #[test]
    fn shell_spawner_reports_nonzero_exit() {
        let mut spawner = ShellSpawner::new();
        let spawned = spawner.spawn_job("exit 3").unwrap();
        let mut code = None;
        for _ in 0..500 {
            code = spawner.try_wait(spawned.pgid);
            if code.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(code, Some(3));
    }

    #[test]
    fn procfs_inspector_sees_own_group() {
        let mut inspector = ProcfsInspector;
        // SAFETY: getpgrp has no preconditions.
        let pgid = unsafe { libc::getpgrp() };
        assert!(inspector.count_in_pgid(pgid) >= 1);
    }
}
