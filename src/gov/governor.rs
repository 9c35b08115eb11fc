//! Admission control: converts live metrics plus queue/running counts into a
//! start/hold/reject verdict, and owns the persisted governor policy.

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorDecision {
    StartNow,
    HoldQueue,
    RejectQueueFull,
}

impl GovernorDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            GovernorDecision::StartNow => "START_NOW",
            GovernorDecision::HoldQueue => "HOLD_QUEUE",
            GovernorDecision::RejectQueueFull => "REJECT_QUEUE_FULL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    None,
    CpuHigh,
    MemHigh,
    QueueFull,
    RunningLimit,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::None => "none",
            BlockReason::CpuHigh => "cpu_high",
            BlockReason::MemHigh => "mem_high",
            BlockReason::QueueFull => "queue_full",
            BlockReason::RunningLimit => "running_limit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GovernorResult {
    pub decision: GovernorDecision,
    pub reason: BlockReason,
    pub retry_after_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorPolicy {
    pub max_running_jobs: i32,
    pub max_queue_depth: i32,
    pub cpu_high_watermark_pct: f64,
    pub mem_high_watermark_pct: f64,
    pub cooldown_ms: u64,
    pub min_start_gap_ms: u64,
}

impl Default for GovernorPolicy {
    fn default() -> Self {
        Self {
            max_running_jobs: 10,
            max_queue_depth: 100,
            cpu_high_watermark_pct: 85.0,
            mem_high_watermark_pct: 90.0,
            cooldown_ms: 1000,
            min_start_gap_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyValidationError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct PolicyUpdateResult {
    pub success: bool,
    pub effective_policy: GovernorPolicy,
    pub errors: Vec<PolicyValidationError>,
}

fn validate_policy(policy: &GovernorPolicy) -> Vec<PolicyValidationError> {
    let mut errors = Vec::new();
    if policy.max_running_jobs < 1 || policy.max_running_jobs > 1000 {
        errors.push(PolicyValidationError {
            field: "max_running_jobs".to_string(),
            message: "must be between 1 and 1000".to_string(),
        });
    }
    if policy.max_queue_depth < 1 || policy.max_queue_depth > 10000 {
        errors.push(PolicyValidationError {
            field: "max_queue_depth".to_string(),
            message: "must be between 1 and 10000".to_string(),
        });
    }
    if policy.cpu_high_watermark_pct.is_nan()
        || !(0.0..=100.0).contains(&policy.cpu_high_watermark_pct)
    {
        errors.push(PolicyValidationError {
            field: "cpu_high_watermark_pct".to_string(),
            message: "must be between 0 and 100".to_string(),
        });
    }
    if policy.mem_high_watermark_pct.is_nan()
        || !(0.0..=100.0).contains(&policy.mem_high_watermark_pct)
    {
        errors.push(PolicyValidationError {
            field: "mem_high_watermark_pct".to_string(),
            message: "must be between 0 and 100".to_string(),
        });
    }
    // cooldown_ms / min_start_gap_ms: any u64 is valid.
    errors
}

pub struct ResourceGovernor {
    policy: GovernorPolicy,
}

impl ResourceGovernor {
    pub fn new(policy: GovernorPolicy) -> Self {
        Self { policy }
    }

    /// Pure admission verdict. Rules are evaluated in priority order and the
    /// first match wins; reordering them changes observable behavior.
    pub fn decide(
        &self,
        cpu_pct: f64,
        mem_pct: f64,
        running_jobs: i32,
        queued_jobs: i32,
    ) -> GovernorResult {
        if queued_jobs >= self.policy.max_queue_depth {
            return GovernorResult {
                decision: GovernorDecision::RejectQueueFull,
                reason: BlockReason::QueueFull,
                retry_after_ms: self.policy.cooldown_ms,
            };
        }
        if running_jobs >= self.policy.max_running_jobs {
            return GovernorResult {
                decision: GovernorDecision::HoldQueue,
                reason: BlockReason::RunningLimit,
                retry_after_ms: self.policy.min_start_gap_ms,
            };
        }
        if cpu_pct >= self.policy.cpu_high_watermark_pct {
            return GovernorResult {
                decision: GovernorDecision::HoldQueue,
                reason: BlockReason::CpuHigh,
                retry_after_ms: self.policy.cooldown_ms,
            };
        }
        if mem_pct >= self.policy.mem_high_watermark_pct {
            return GovernorResult {
                decision: GovernorDecision::HoldQueue,
                reason: BlockReason::MemHigh,
                retry_after_ms: self.policy.cooldown_ms,
            };
        }
        GovernorResult {
            decision: GovernorDecision::StartNow,
            reason: BlockReason::None,
            retry_after_ms: 0,
        }
    }

    pub fn policy(&self) -> &GovernorPolicy {
        &self.policy
    }

    /// Validate every field first, then commit atomically; a single invalid
    /// field rejects the whole update.
    pub fn validate_and_update(&mut self, policy: GovernorPolicy) -> PolicyUpdateResult {
        let errors = validate_policy(&policy);
        if errors.is_empty() {
            self.policy = policy;
            PolicyUpdateResult {
                success: true,
                effective_policy: self.policy.clone(),
                errors,
            }
        } else {
            PolicyUpdateResult {
                success: false,
                effective_policy: self.policy.clone(),
                errors,
            }
        }
    }
}

/// Partial update body for `governor/policy_update`. Unknown fields reject
/// the whole request; absent fields keep their current values.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyUpdateBody {
    pub max_running_jobs: Option<i32>,
    pub max_queue_depth: Option<i32>,
    pub cpu_high_watermark_pct: Option<f64>,
    pub mem_high_watermark_pct: Option<f64>,
    pub cooldown_ms: Option<u64>,
    pub min_start_gap_ms: Option<u64>,
}

impl PolicyUpdateBody {
    pub fn overlay(&self, base: &GovernorPolicy) -> GovernorPolicy {
        GovernorPolicy {
            max_running_jobs: self.max_running_jobs.unwrap_or(base.max_running_jobs),
            max_queue_depth: self.max_queue_depth.unwrap_or(base.max_queue_depth),
            cpu_high_watermark_pct: self
                .cpu_high_watermark_pct
                .unwrap_or(base.cpu_high_watermark_pct),
            mem_high_watermark_pct: self
                .mem_high_watermark_pct
                .unwrap_or(base.mem_high_watermark_pct),
            cooldown_ms: self.cooldown_ms.unwrap_or(base.cooldown_ms),
            min_start_gap_ms: self.min_start_gap_ms.unwrap_or(base.min_start_gap_ms),
        }
    }
}

/// On-disk governor policy, same JSON shape as the update payload. A missing
/// or malformed file falls back to defaults; saves go through a temp file,
/// fsync and rename so a crash never leaves a torn policy behind.
pub struct PolicyFile {
    path: PathBuf,
}

impl PolicyFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> GovernorPolicy {
        let raw = match fs::read_to_string(&self.path) {
            Ok(r) => r,
            Err(_) => return GovernorPolicy::default(),
        };
        let parsed: PolicyUpdateBody = match serde_json::from_str(&raw) {
            Ok(p) => p,
            Err(_) => return GovernorPolicy::default(),
        };
        let mut policy = parsed.overlay(&GovernorPolicy::default());
        // Out-of-range persisted fields fall back per-field rather than
        // discarding the whole file.
        for err in validate_policy(&policy) {
            let defaults = GovernorPolicy::default();
            match err.field.as_str() {
                "max_running_jobs" => policy.max_running_jobs = defaults.max_running_jobs,
                "max_queue_depth" => policy.max_queue_depth = defaults.max_queue_depth,
                "cpu_high_watermark_pct" => {
                    policy.cpu_high_watermark_pct = defaults.cpu_high_watermark_pct
                }
                "mem_high_watermark_pct" => {
                    policy.mem_high_watermark_pct = defaults.mem_high_watermark_pct
                }
                _ => {}
            }
        }
        policy
    }

    pub fn save(&self, policy: &GovernorPolicy) -> anyhow::Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut f = fs::File::create(&tmp)
                .with_context(|| format!("create temp policy file {}", tmp.display()))?;
            let body = serde_json::to_string_pretty(policy)?;
            f.write_all(body.as_bytes())
                .with_context(|| format!("write {}", tmp.display()))?;
            f.write_all(b"\n")?;
            f.sync_all()
                .with_context(|| format!("fsync {}", tmp.display()))?;
        }
        fs::rename(&tmp, &self.path).with_context(|| {
            format!("rename {} -> {}", tmp.display(), self.path.display())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_table_under_defaults() {
        let gov = ResourceGovernor::new(GovernorPolicy::default());

        let r = gov.decide(50.0, 60.0, 5, 0);
        assert_eq!(r.decision, GovernorDecision::StartNow);
        assert_eq!(r.reason, BlockReason::None);
        assert_eq!(r.retry_after_ms, 0);

        let r = gov.decide(50.0, 60.0, 5, 100);
        assert_eq!(r.decision, GovernorDecision::RejectQueueFull);
        assert_eq!(r.reason, BlockReason::QueueFull);
        assert_eq!(r.retry_after_ms, 1000);

        let r = gov.decide(90.0, 60.0, 5, 5);
        assert_eq!(r.decision, GovernorDecision::HoldQueue);
        assert_eq!(r.reason, BlockReason::CpuHigh);

        let r = gov.decide(50.0, 95.0, 5, 5);
        assert_eq!(r.decision, GovernorDecision::HoldQueue);
        assert_eq!(r.reason, BlockReason::MemHigh);

        let r = gov.decide(50.0, 60.0, 10, 5);
        assert_eq!(r.decision, GovernorDecision::HoldQueue);
        assert_eq!(r.reason, BlockReason::RunningLimit);
        assert_eq!(r.retry_after_ms, 100);
    }

    #[test]
    fn rule_priority_queue_full_beats_everything() {
        let gov = ResourceGovernor::new(GovernorPolicy::default());
        // All conditions trip at once; the first rule wins.
        let r = gov.decide(99.0, 99.0, 100, 100);
        assert_eq!(r.decision, GovernorDecision::RejectQueueFull);
        assert_eq!(r.reason, BlockReason::QueueFull);

        // Same, minus the full queue: running limit wins over watermarks.
        let r = gov.decide(99.0, 99.0, 100, 5);
        assert_eq!(r.reason, BlockReason::RunningLimit);

        // CPU wins over memory.
        let r = gov.decide(99.0, 99.0, 0, 0);
        assert_eq!(r.reason, BlockReason::CpuHigh);
    }

    #[test]
    fn watermarks_are_inclusive() {
        let gov = ResourceGovernor::new(GovernorPolicy::default());
        let r = gov.decide(85.0, 0.0, 0, 0);
        assert_eq!(r.reason, BlockReason::CpuHigh);
        let r = gov.decide(84.9, 90.0, 0, 0);
        assert_eq!(r.reason, BlockReason::MemHigh);
    }

    #[test]
    fn update_rejects_out_of_range_fields_atomically() {
        let mut gov = ResourceGovernor::new(GovernorPolicy::default());
        let bad = GovernorPolicy {
            max_running_jobs: 0,
            max_queue_depth: 20000,
            ..Default::default()
        };
        let r = gov.validate_and_update(bad);
        assert!(!r.success);
        assert_eq!(r.errors.len(), 2);
        assert_eq!(r.errors[0].field, "max_running_jobs");
        assert_eq!(r.errors[1].field, "max_queue_depth");
        // Nothing committed.
        assert_eq!(gov.policy().max_running_jobs, 10);
        assert_eq!(gov.policy().max_queue_depth, 100);
    }

    #[test]
    fn update_rejects_nan_watermarks() {
        let mut gov = ResourceGovernor::new(GovernorPolicy::default());
        let bad = GovernorPolicy {
            cpu_high_watermark_pct: f64::NAN,
            ..Default::default()
        };
        let r = gov.validate_and_update(bad);
        assert!(!r.success);
        assert_eq!(r.errors[0].field, "cpu_high_watermark_pct");
    }

    #[test]
    fn update_commits_valid_policy() {
        let mut gov = ResourceGovernor::new(GovernorPolicy::default());
        let next = GovernorPolicy {
            max_running_jobs: 3,
            cooldown_ms: 250,
            ..Default::default()
        };
        let r = gov.validate_and_update(next.clone());
        assert!(r.success);
        assert_eq!(r.effective_policy, next);
        assert_eq!(gov.policy().max_running_jobs, 3);
    }

    #[test]
    fn update_body_rejects_unknown_fields() {
        let err = serde_json::from_str::<PolicyUpdateBody>(r#"{"max_running_jobs":5,"bogus":1}"#);
        assert!(err.is_err());
    }

    #[test]
    fn policy_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PolicyFile::new(dir.path().join("governor.json"));
        let policy = GovernorPolicy {
            max_running_jobs: 7,
            max_queue_depth: 42,
            cpu_high_watermark_pct: 70.0,
            mem_high_watermark_pct: 80.0,
            cooldown_ms: 500,
            min_start_gap_ms: 50,
        };
        store.save(&policy).unwrap();
        assert_eq!(store.load(), policy);
    }

    #[test]
    fn policy_file_missing_or_malformed_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = PolicyFile::new(dir.path().join("absent.json"));
        assert_eq!(store.load(), GovernorPolicy::default());

        let path = dir.path().join("garbled.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(PolicyFile::new(path).load(), GovernorPolicy::default());
    }

    #[test]
    fn policy_file_out_of_range_field_defaults_per_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("governor.json");
        std::fs::write(&path, r#"{"max_running_jobs":5000,"cooldown_ms":77}"#).unwrap();
        let policy = PolicyFile::new(path).load();
        assert_eq!(policy.max_running_jobs, 10);
        assert_eq!(policy.cooldown_ms, 77);
    }
}
