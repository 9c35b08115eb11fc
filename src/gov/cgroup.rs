//! Cgroup-v2 driver for per-PID resource ceilings.
//!
//! Availability is probed once at construction (unified hierarchy mount +
//! controller set). When unavailable every apply is a successful no-op; the
//! caller is responsible for surfacing that as a rate-limited event.

use crate::gov::group_store::GroupPolicy;
use anyhow::Context as _;
use nix::errno::Errno;
use std::ffi::CString;
use std::fs;
use std::io::Write as _;
use std::os::unix::ffi::OsStrExt as _;
use std::path::{Path, PathBuf};

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";
pub const DEFAULT_CGROUP_NAME: &str = "govmaster";
pub const DEFAULT_CPU_PERIOD_US: u64 = 100_000;

const CGROUP2_SUPER_MAGIC: i64 = 0x63677270;

/// Controller availability bits, also used as the applied-field report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CgroupCaps(pub u8);

impl CgroupCaps {
    pub const CPU: u8 = 1 << 0;
    pub const MEMORY: u8 = 1 << 1;
    pub const PIDS: u8 = 1 << 2;

    pub fn set(&mut self, bit: u8) {
        self.0 |= bit;
    }

    pub fn has(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct CgroupApply {
    pub ok: bool,
    pub errno: i32,
    pub detail: String,
    pub applied: CgroupCaps,
}

fn write_file(path: &Path, content: &str) -> anyhow::Result<()> {
    let mut f = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("open for write {}", path.display()))?;
    f.write_all(content.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn is_cgroup2(root: &Path) -> bool {
    let Ok(c_path) = CString::new(root.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: statfs fills the buffer; result checked before reading it.
    let mut fs_info: libc::statfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statfs(c_path.as_ptr(), &mut fs_info) };
    ret == 0 && fs_info.f_type as i64 == CGROUP2_SUPER_MAGIC
}

pub struct CgroupDriver {
    available: bool,
    caps: CgroupCaps,
    base_path: PathBuf,
}

impl CgroupDriver {
    pub fn new(root: impl Into<PathBuf>, name: &str) -> Self {
        let root = root.into();
        let base_path = root.join(name);
        let mut driver = Self {
            available: false,
            caps: CgroupCaps::default(),
            base_path,
        };
        driver.available = driver.detect(&root);
        driver
    }

    pub fn detect_default() -> Self {
        Self::new(DEFAULT_CGROUP_ROOT, DEFAULT_CGROUP_NAME)
    }

    /// Force an available driver over an arbitrary directory. Tests pre-create
    /// the controller files apply() writes to, standing in for cgroupfs.
    #[cfg(test)]
    pub(crate) fn available_for_test(base_path: PathBuf, caps: CgroupCaps) -> Self {
        fs::create_dir_all(&base_path).expect("create test cgroup base");
        Self {
            available: true,
            caps,
            base_path,
        }
    }

    fn detect(&mut self, root: &Path) -> bool {
        if !is_cgroup2(root) {
            return false;
        }

        let Ok(controllers) = fs::read_to_string(root.join("cgroup.controllers")) else {
            return false;
        };
        for ctrl in controllers.split_whitespace() {
            match ctrl {
                "cpu" => self.caps.set(CgroupCaps::CPU),
                "memory" => self.caps.set(CgroupCaps::MEMORY),
                "pids" => self.caps.set(CgroupCaps::PIDS),
                _ => {}
            }
        }
        if self.caps.is_empty() {
            return false;
        }

        fs::create_dir_all(&self.base_path).is_ok()
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn capability(&self) -> CgroupCaps {
        self.caps
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn pid_dir(&self, pid: i32) -> PathBuf {
        self.base_path.join(pid.to_string())
    }

    /// Render the `cpu.max` line from the merged policy. Explicit quota wins
    /// over the percentage form; the percentage converts as
    /// quota = max_pct * period / 100.
    pub(crate) fn cpu_max_line(policy: &GroupPolicy) -> Option<String> {
        let period = policy
            .cpu_period_us
            .map(u64::from)
            .unwrap_or(DEFAULT_CPU_PERIOD_US);
        if let Some(quota) = policy.cpu_quota_us {
            return Some(format!("{quota} {period}\n"));
        }
        let pct = policy.cpu_max_pct? as u64;
        let quota = pct * period / 100;
        Some(format!("{quota} {period}\n"))
    }

    /// Move `pid` into its own sub-cgroup and write the merged ceilings.
    /// Missing controllers are skipped; `applied` reports what took effect.
    pub fn apply(&self, pid: i32, policy: &GroupPolicy) -> CgroupApply {
        let mut result = CgroupApply::default();

        if !self.available {
            result.ok = true;
            return result;
        }

        let dir = self.pid_dir(pid);
        if let Err(e) = fs::create_dir_all(&dir) {
            result.errno = e.raw_os_error().unwrap_or(Errno::EIO as i32);
            result.detail = format!("create cgroup {}: {e}", dir.display());
            return result;
        }

        if let Err(e) = write_file(&dir.join("cgroup.procs"), &format!("{pid}")) {
            result.errno = e
                .downcast_ref::<std::io::Error>()
                .and_then(|io| io.raw_os_error())
                .unwrap_or(Errno::EIO as i32);
            result.detail = format!("{e:#}");
            return result;
        }

        if self.caps.has(CgroupCaps::CPU) {
            if let Some(line) = Self::cpu_max_line(policy) {
                if write_file(&dir.join("cpu.max"), &line).is_ok() {
                    result.applied.set(CgroupCaps::CPU);
                }
            }
        }

        if self.caps.has(CgroupCaps::MEMORY) {
            let mut wrote = false;
            if let Some(max) = policy.mem_max_bytes {
                wrote |= write_file(&dir.join("memory.max"), &format!("{max}\n")).is_ok();
            }
            if let Some(high) = policy.mem_high_bytes {
                wrote |= write_file(&dir.join("memory.high"), &format!("{high}\n")).is_ok();
            }
            if wrote {
                result.applied.set(CgroupCaps::MEMORY);
            }
        }

        if self.caps.has(CgroupCaps::PIDS) {
            if let Some(max) = policy.pids_max {
                if write_file(&dir.join("pids.max"), &format!("{max}\n")).is_ok() {
                    result.applied.set(CgroupCaps::PIDS);
                }
            }
        }

        result.ok = true;
        result
    }

    /// Remove the per-PID cgroup once the process is gone. Best-effort: the
    /// kernel refuses while members remain.
    pub fn cleanup(&self, pid: i32) {
        if !self.available {
            return;
        }
        let _ = fs::remove_dir(self.pid_dir(pid));
    }
}
