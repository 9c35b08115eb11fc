//! System metrics: delta-based CPU utilization from /proc/stat, memory from
//! /proc/meminfo, and a bounded on-disk CSV history with size rotation.

use anyhow::Context as _;
use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStats {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
}

impl CpuStats {
    fn total(&self) -> u64 {
        self.user + self.nice + self.system + self.idle + self.iowait + self.irq + self.softirq
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemStats {
    /// All values in KiB, as /proc/meminfo reports them.
    pub total: u64,
    pub free: u64,
    pub available: u64,
    pub buffers: u64,
    pub cached: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f64,
    pub mem: MemStats,
    /// Seconds since the epoch at sample time.
    pub timestamp: u64,
}

impl SystemMetrics {
    /// Used-memory percentage, judged by MemAvailable when present.
    pub fn mem_usage_percent(&self) -> f64 {
        if self.mem.total == 0 {
            return 0.0;
        }
        let free_ish = if self.mem.available > 0 {
            self.mem.available
        } else {
            self.mem.free
        };
        100.0 * (self.mem.total.saturating_sub(free_ish)) as f64 / self.mem.total as f64
    }
}

pub(crate) fn parse_proc_stat_cpu_line(line: &str) -> Option<CpuStats> {
    let mut it = line.split_whitespace();
    let tag = it.next()?;
    if !tag.starts_with("cpu") {
        return None;
    }
    let mut vals = [0u64; 7];
    for v in vals.iter_mut() {
        *v = it.next()?.parse().ok()?;
    }
    Some(CpuStats {
        user: vals[0],
        nice: vals[1],
        system: vals[2],
        idle: vals[3],
        iowait: vals[4],
        irq: vals[5],
        softirq: vals[6],
    })
}

pub(crate) fn parse_meminfo(content: &str) -> MemStats {
    let mut stats = MemStats::default();
    for line in content.lines() {
        let mut it = line.split_whitespace();
        let (Some(key), Some(value)) = (it.next(), it.next()) else {
            continue;
        };
        let Ok(value) = value.parse::<u64>() else {
            continue;
        };
        match key {
            "MemTotal:" => stats.total = value,
            "MemFree:" => stats.free = value,
            "MemAvailable:" => stats.available = value,
            "Buffers:" => stats.buffers = value,
            "Cached:" => stats.cached = value,
            _ => {}
        }
    }
    stats
}

/// Samples /proc; the first sample reports 0% CPU because utilization is a
/// delta over the previous counters.
pub struct MetricsSampler {
    prev_cpu: CpuStats,
    first_sample: bool,
}

impl Default for MetricsSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSampler {
    pub fn new() -> Self {
        Self {
            prev_cpu: CpuStats::default(),
            first_sample: true,
        }
    }

    fn read_cpu_stats() -> CpuStats {
        let Ok(content) = fs::read_to_string("/proc/stat") else {
            return CpuStats::default();
        };
        content
            .lines()
            .find_map(parse_proc_stat_cpu_line)
            .unwrap_or_default()
    }

    fn read_mem_stats() -> MemStats {
        let Ok(content) = fs::read_to_string("/proc/meminfo") else {
            return MemStats::default();
        };
        parse_meminfo(&content)
    }

    pub fn sample(&mut self) -> SystemMetrics {
        let mut metrics = SystemMetrics {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            ..Default::default()
        };

        let current = Self::read_cpu_stats();
        metrics.mem = Self::read_mem_stats();

        if !self.first_sample {
            let delta_total = current.total().saturating_sub(self.prev_cpu.total());
            let delta_idle = current.idle.saturating_sub(self.prev_cpu.idle);
            if delta_total > 0 {
                metrics.cpu_usage_percent =
                    100.0 * (delta_total - delta_idle.min(delta_total)) as f64 / delta_total as f64;
            }
        }

        self.prev_cpu = current;
        self.first_sample = false;
        metrics
    }

    pub fn compute_cpu_percent(prev: &CpuStats, current: &CpuStats) -> f64 {
        let delta_total = current.total().saturating_sub(prev.total());
        let delta_idle = current.idle.saturating_sub(prev.idle);
        if delta_total == 0 {
            return 0.0;
        }
        100.0 * (delta_total - delta_idle.min(delta_total)) as f64 / delta_total as f64
    }
}

/// Append-only CSV history (`ts,cpu_pct,mem_total,mem_free`) with numbered
/// size-based rotation under the state directory.
pub struct MetricsHistory {
    state_dir: PathBuf,
    max_file_size: u64,
    max_files: usize,
}

impl MetricsHistory {
    pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024;
    pub const DEFAULT_MAX_FILES: usize = 5;

    pub fn new(state_dir: impl Into<PathBuf>, max_file_size: u64, max_files: usize) -> Self {
        let state_dir = state_dir.into();
        let _ = fs::create_dir_all(&state_dir);
        Self {
            state_dir,
            max_file_size,
            max_files,
        }
    }

    fn current_file(&self) -> PathBuf {
        self.state_dir.join("metrics.log")
    }

    pub fn append(&self, metrics: &SystemMetrics) -> anyhow::Result<()> {
        let path = self.current_file();
        if let Ok(meta) = fs::metadata(&path) {
            if meta.len() > self.max_file_size {
                self.rotate_files();
            }
        }
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        writeln!(
            f,
            "{},{:.2},{},{}",
            metrics.timestamp, metrics.cpu_usage_percent, metrics.mem.total, metrics.mem.free
        )
        .with_context(|| format!("append {}", path.display()))?;
        Ok(())
    }

    pub fn tail(&self, n: usize) -> Vec<SystemMetrics> {
        let Ok(content) = fs::read_to_string(self.current_file()) else {
            return Vec::new();
        };
        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..]
            .iter()
            .filter_map(|line| Self::parse_row(line))
            .collect()
    }

    fn parse_row(line: &str) -> Option<SystemMetrics> {
        let mut it = line.split(',');
        let timestamp = it.next()?.trim().parse().ok()?;
        let cpu_usage_percent = it.next()?.trim().parse().ok()?;
        let total = it.next()?.trim().parse().ok()?;
        let free = it.next()?.trim().parse().ok()?;
        Some(SystemMetrics {
            timestamp,
            cpu_usage_percent,
            mem: MemStats {
                total,
                free,
                ..Default::default()
            },
        })
    }

    fn rotate_files(&self) {
        let base = self.current_file();
        let numbered = |i: usize| self.state_dir.join(format!("metrics.log.{i}"));

        let _ = fs::remove_file(numbered(self.max_files.saturating_sub(1)));
        for i in (0..self.max_files.saturating_sub(1)).rev() {
            let from = if i == 0 { base.clone() } else { numbered(i) };
            if from.exists() {
                let _ = fs::rename(&from, numbered(i + 1));
            }
        }
    }
}
