//! Per-PID kernel primitives: scheduler affinity, nice, prlimit, OOM adjust.
//!
//! Appliers never panic and never unwind the worker; every failure comes back
//! as an `ApplyOutcome` with the errno and a detail naming the primitive.

use crate::gov::rule::{ApplyFields, RlimPolicy};
use nix::errno::Errno;
use nix::sched::CpuSet;
use nix::unistd::Pid;

#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    pub ok: bool,
    pub errno: i32,
    pub detail: String,
    pub applied: ApplyFields,
    /// Expected-in-normal-operation failures (EPERM on nice, EACCES on
    /// oom_score_adj for short-lived pids); reported but not alarming.
    pub transient: bool,
}

impl ApplyOutcome {
    pub fn success(applied_bit: u8) -> Self {
        let mut applied = ApplyFields::default();
        applied.set(applied_bit);
        Self {
            ok: true,
            applied,
            ..Default::default()
        }
    }

    fn fail(errno: i32, detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            errno,
            detail: detail.into(),
            ..Default::default()
        }
    }

    fn fail_transient(errno: i32, detail: impl Into<String>) -> Self {
        Self {
            transient: true,
            ..Self::fail(errno, detail)
        }
    }
}

pub fn host_cpu_count() -> usize {
    // SAFETY: sysconf is always safe to call.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if n <= 0 {
        1
    } else {
        n as usize
    }
}

/// Parse a cpu-list (`"0-3,5, 7"`): comma-separated singletons and ranges,
/// whitespace tolerated. None for an empty list, a backwards range, or any
/// cpu at or beyond `max_cpus`.
pub fn parse_cpu_list(affinity: &str, max_cpus: usize) -> Option<Vec<usize>> {
    let mut cpus = Vec::new();
    for part in affinity.split(',') {
        let part: String = part.chars().filter(|c| *c != ' ' && *c != '\t').collect();
        if part.is_empty() {
            continue;
        }
        if let Some((left, right)) = part.split_once('-') {
            let start: usize = left.parse().ok()?;
            let end: usize = right.parse().ok()?;
            if start > end || end >= max_cpus {
                return None;
            }
            cpus.extend(start..=end);
        } else {
            let cpu: usize = part.parse().ok()?;
            if cpu >= max_cpus {
                return None;
            }
            cpus.push(cpu);
        }
    }
    if cpus.is_empty() {
        None
    } else {
        Some(cpus)
    }
}

pub fn apply_affinity(pid: i32, affinity: &str) -> ApplyOutcome {
    let Some(cpus) = parse_cpu_list(affinity, host_cpu_count()) else {
        return ApplyOutcome::fail(Errno::EINVAL as i32, "invalid cpu list format");
    };

    let mut mask = CpuSet::new();
    for cpu in cpus {
        if mask.set(cpu).is_err() {
            return ApplyOutcome::fail(Errno::EINVAL as i32, format!("cpu {cpu} beyond mask size"));
        }
    }

    match nix::sched::sched_setaffinity(Pid::from_raw(pid), &mask) {
        Ok(()) => ApplyOutcome::success(ApplyFields::CPU_AFFINITY),
        Err(e) => ApplyOutcome::fail(e as i32, format!("sched_setaffinity: {}", e.desc())),
    }
}

pub fn apply_nice(pid: i32, nice: i8) -> ApplyOutcome {
    // SAFETY: setpriority returns 0 on success, -1 with errno on failure.
    let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, nice as i32) };
    if ret != 0 {
        let e = Errno::last();
        // EPERM means the value was legal but we may not lower the priority
        // of that process; distinct from a malformed request.
        return if e == Errno::EPERM {
            ApplyOutcome::fail_transient(e as i32, format!("setpriority: {}", e.desc()))
        } else {
            ApplyOutcome::fail(e as i32, format!("setpriority: {}", e.desc()))
        };
    }
    ApplyOutcome::success(ApplyFields::CPU_NICE)
}

fn prlimit_get(pid: i32, resource: libc::__rlimit_resource_t) -> Result<libc::rlimit, Errno> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: old_limit points at a valid rlimit; new_limit null means read.
    let ret = unsafe { libc::prlimit(pid, resource, std::ptr::null(), &mut current) };
    if ret != 0 {
        return Err(Errno::last());
    }
    Ok(current)
}

fn prlimit_set(
    pid: i32,
    resource: libc::__rlimit_resource_t,
    name: &str,
    soft: Option<u64>,
    hard: Option<u64>,
) -> Result<(), ApplyOutcome> {
    if soft.is_none() && hard.is_none() {
        return Ok(());
    }
    // Only half supplied: read the target's current limit for the other half.
    let mut rl = if soft.is_none() || hard.is_none() {
        prlimit_get(pid, resource).map_err(|e| {
            ApplyOutcome::fail(e as i32, format!("prlimit get {name}: {}", e.desc()))
        })?
    } else {
        libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        }
    };
    if let Some(s) = soft {
        rl.rlim_cur = s;
    }
    if let Some(h) = hard {
        rl.rlim_max = h;
    }
    // SAFETY: new_limit points at a valid rlimit; old_limit null.
    let ret = unsafe { libc::prlimit(pid, resource, &rl, std::ptr::null_mut()) };
    if ret != 0 {
        let e = Errno::last();
        return Err(ApplyOutcome::fail(
            e as i32,
            format!("prlimit {name}: {}", e.desc()),
        ));
    }
    Ok(())
}

pub fn apply_rlimit(pid: i32, rlim: &RlimPolicy) -> ApplyOutcome {
    if let Err(out) = prlimit_set(
        pid,
        libc::RLIMIT_NOFILE,
        "RLIMIT_NOFILE",
        rlim.nofile_soft,
        rlim.nofile_hard,
    ) {
        return out;
    }
    if let Err(out) = prlimit_set(
        pid,
        libc::RLIMIT_CORE,
        "RLIMIT_CORE",
        rlim.core_soft,
        rlim.core_hard,
    ) {
        return out;
    }

    let mut applied = ApplyFields::default();
    if rlim.nofile_soft.is_some() || rlim.nofile_hard.is_some() {
        applied.set(ApplyFields::RLIM_NOFILE);
    }
    if rlim.core_soft.is_some() || rlim.core_hard.is_some() {
        applied.set(ApplyFields::RLIM_CORE);
    }
    ApplyOutcome {
        ok: true,
        applied,
        ..Default::default()
    }
}

pub fn apply_oom_score_adj(pid: i32, oom_score_adj: i32) -> ApplyOutcome {
    let path = format!("/proc/{pid}/oom_score_adj");
    match std::fs::write(&path, format!("{oom_score_adj}")) {
        Ok(()) => ApplyOutcome::success(ApplyFields::OOM_SCORE_ADJ),
        Err(e) => {
            let errno = e.raw_os_error().unwrap_or(Errno::EIO as i32);
            // EACCES happens routinely for pids exiting under us.
            if errno == Errno::EACCES as i32 {
                ApplyOutcome::fail_transient(errno, format!("write {path}: {e}"))
            } else {
                ApplyOutcome::fail(errno, format!("write {path}: {e}"))
            }
        }
    }
}
