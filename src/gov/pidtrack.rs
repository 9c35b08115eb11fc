//! Process-liveness tracking without polling.
//!
//! Each tracked pid gets a pidfd registered in an epoll set; kernels without
//! pidfd_open fall back to a `(pid, start_time_ticks)` fingerprint from
//! `/proc/<pid>/stat`, checked during periodic cleanup. The table is bounded;
//! inserting past capacity evicts the least-recently-seen entry.

use std::collections::HashMap;
use std::fs;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Mutex;
use std::time::Instant;

pub const MAX_TRACKED_PIDS: usize = 4096;
const EPOLL_MAX_EVENTS: usize = 64;

/// Parse start_time (field 22) out of a full /proc/<pid>/stat line. The comm
/// field may contain spaces and parentheses, so fields are counted from the
/// last ')'.
pub(crate) fn parse_start_time_from_stat_line(line: &str) -> Option<u64> {
    let after_comm = &line[line.rfind(')')? + 1..];
    // after_comm starts at field 3 (state).
    after_comm
        .split_whitespace()
        .nth(19)
        .and_then(|tok| tok.parse().ok())
}

pub(crate) fn read_proc_start_time_ticks(pid: i32) -> Option<u64> {
    let line = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_start_time_from_stat_line(&line)
}

fn pidfd_open(pid: i32) -> Option<OwnedFd> {
    // SAFETY: pidfd_open takes (pid, flags) and returns a new fd or -1.
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
    if fd < 0 {
        return None;
    }
    // SAFETY: the kernel just handed us ownership of this fd.
    Some(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

#[derive(Debug)]
enum Liveness {
    /// Exit is signalled through the epoll set.
    Pidfd(OwnedFd),
    /// Exit is detected when the stat fingerprint stops matching.
    StartTime(u64),
}

#[derive(Debug)]
struct Tracked {
    liveness: Liveness,
    last_seen_ns: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrackResult {
    pub ok: bool,
    /// Pid dropped to make room, if the table was full.
    pub evicted: Option<i32>,
}

pub struct PidTracker {
    epoll_fd: OwnedFd,
    table: Mutex<HashMap<i32, Tracked>>,
    epoch: Instant,
}

impl PidTracker {
    /// Fails only if the epoll fd cannot be created; that is fatal for the
    /// apply pipeline and must propagate to the daemon.
    pub fn new() -> anyhow::Result<Self> {
        // SAFETY: plain syscall wrapper; result checked below.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(anyhow::anyhow!(
                "epoll_create1 failed: {}",
                std::io::Error::last_os_error()
            ));
        }
        Ok(Self {
            // SAFETY: fd was just created and is owned here.
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            table: Mutex::new(HashMap::new()),
            epoch: Instant::now(),
        })
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn epoll_add(&self, fd: RawFd, pid: i32) -> bool {
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32,
            u64: pid as u64,
        };
        // SAFETY: fd and event are valid for the duration of the call.
        unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut ev) == 0 }
    }

    fn epoll_del(&self, fd: RawFd) {
        // SAFETY: removing a registered fd; failure is harmless (fd may
        // already be gone from the set).
        unsafe {
            libc::epoll_ctl(
                self.epoll_fd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            );
        }
    }

    /// Begin tracking a pid, touching it if already tracked. `ok == false`
    /// means the process could not be observed either way (already dead).
    pub fn track(&self, pid: i32) -> TrackResult {
        let mut table = self.table.lock().unwrap_or_else(|p| p.into_inner());
        let mut result = TrackResult::default();

        if let Some(entry) = table.get_mut(&pid) {
            entry.last_seen_ns = self.now_ns();
            result.ok = true;
            return result;
        }

        if table.len() >= MAX_TRACKED_PIDS {
            let oldest = table
                .iter()
                .min_by_key(|(_, t)| t.last_seen_ns)
                .map(|(p, _)| *p);
            if let Some(old_pid) = oldest {
                if let Some(t) = table.remove(&old_pid) {
                    if let Liveness::Pidfd(fd) = &t.liveness {
                        self.epoll_del(fd.as_raw_fd());
                    }
                }
                result.evicted = Some(old_pid);
            }
        }

        let liveness = match pidfd_open(pid) {
            Some(fd) if self.epoll_add(fd.as_raw_fd(), pid) => Liveness::Pidfd(fd),
            _ => match read_proc_start_time_ticks(pid) {
                Some(ticks) => Liveness::StartTime(ticks),
                None => return result,
            },
        };

        table.insert(
            pid,
            Tracked {
                liveness,
                last_seen_ns: self.now_ns(),
            },
        );
        result.ok = true;
        result
    }

    pub fn untrack(&self, pid: i32) {
        let mut table = self.table.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(t) = table.remove(&pid) {
            if let Liveness::Pidfd(fd) = &t.liveness {
                self.epoll_del(fd.as_raw_fd());
            }
        }
    }

    /// Block in epoll for up to `timeout_ms` and return pids whose pidfd
    /// signalled exit. Called from the single epoll-owning thread.
    pub fn poll_exits(&self, timeout_ms: i32) -> Vec<i32> {
        let mut events: [libc::epoll_event; EPOLL_MAX_EVENTS] =
            // SAFETY: epoll_event is plain data; the kernel fills it in.
            unsafe { std::mem::zeroed() };
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                events.as_mut_ptr(),
                EPOLL_MAX_EVENTS as i32,
                timeout_ms,
            )
        };
        if n <= 0 {
            return Vec::new();
        }

        let mut exited = Vec::new();
        for ev in events.iter().take(n as usize) {
            let mask = (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;
            if ev.events & mask != 0 {
                exited.push(ev.u64 as i32);
            }
        }
        for pid in &exited {
            self.untrack(*pid);
        }
        exited
    }

    /// Sweep start-time-tracked pids whose /proc entry vanished or was reused
    /// by a new process. Returns the pids now known dead.
    pub fn cleanup_dead(&self) -> Vec<i32> {
        let mut table = self.table.lock().unwrap_or_else(|p| p.into_inner());
        let dead: Vec<i32> = table
            .iter()
            .filter_map(|(pid, t)| match t.liveness {
                Liveness::StartTime(ticks) => match read_proc_start_time_ticks(*pid) {
                    Some(current) if current == ticks => None,
                    _ => Some(*pid),
                },
                Liveness::Pidfd(_) => None,
            })
            .collect();
        for pid in &dead {
            table.remove(pid);
        }
        dead
    }

    pub fn tracked_count(&self) -> usize {
        self.table.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_tracked(&self, pid: i32) -> bool {
        self.table
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(&pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_time_field_22() {
        let line = "1234 (cat) R 1 1234 1234 0 -1 4194304 95 0 0 0 0 0 0 0 20 0 1 0 5812 \
                    8192000 180 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 3 0 0 0 0 0";
        assert_eq!(parse_start_time_from_stat_line(line), Some(5812));
    }

    #[test]
    fn parses_comm_with_spaces_and_parens() {
        let line = "77 (tmux: server (x)) S 1 77 77 0 -1 4194304 0 0 0 0 0 0 0 0 20 0 1 0 \
                    999 0 0 18446744073709551615 0 0 0 0 0 0 0 0 0 0 0 0 17 1 0 0 0 0 0";
        assert_eq!(parse_start_time_from_stat_line(line), Some(999));
    }

    #[test]
    fn malformed_stat_lines_yield_none() {
        assert_eq!(parse_start_time_from_stat_line(""), None);
        assert_eq!(parse_start_time_from_stat_line("no comm here"), None);
        assert_eq!(parse_start_time_from_stat_line("1 (x) R 1 2"), None);
    }

    #[test]
    fn tracks_own_pid() {
        let tracker = PidTracker::new().unwrap();
        let me = std::process::id() as i32;
        let r = tracker.track(me);
        assert!(r.ok);
        assert!(r.evicted.is_none());
        assert!(tracker.is_tracked(me));
        assert_eq!(tracker.tracked_count(), 1);

        // Tracking again touches, not duplicates.
        assert!(tracker.track(me).ok);
        assert_eq!(tracker.tracked_count(), 1);

        tracker.untrack(me);
        assert!(!tracker.is_tracked(me));
    }

    #[test]
    fn refuses_dead_pid() {
        let tracker = PidTracker::new().unwrap();
        // A pid from the far end of the default pid space; if this exists the
        // assertion below is skipped rather than made flaky.
        let pid = 0x3ffff0;
        if fs::metadata(format!("/proc/{pid}")).is_ok() {
            return;
        }
        let r = tracker.track(pid);
        assert!(!r.ok);
        assert!(!tracker.is_tracked(pid));
    }

    #[test]
    fn cleanup_reports_vanished_starttime_pids() {
        let tracker = PidTracker::new().unwrap();
        // Forge a start-time entry for a pid that does not exist.
        let pid = 0x3ffff1;
        if fs::metadata(format!("/proc/{pid}")).is_ok() {
            return;
        }
        tracker
            .table
            .lock()
            .unwrap()
            .insert(pid, Tracked { liveness: Liveness::StartTime(42), last_seen_ns: 0 });
        let dead = tracker.cleanup_dead();
        assert_eq!(dead, vec![pid]);
        assert!(!tracker.is_tracked(pid));
    }
}
