//! Tick-driven job supervision: admission, start budget, round-robin scan
//! cursor, runtime/log/process-count ceilings and two-phase kill escalation.
//!
//! `tick(now_ms, metrics)` is the only progression primitive. Between ticks
//! the runner does nothing, and a repeated tick at the same timestamp is a
//! no-op, which makes transition sequences reproducible under an injected
//! spawner and inspector.

use crate::gov::governor::{
    BlockReason, GovernorDecision, GovernorPolicy, GovernorResult, PolicyUpdateResult,
    ResourceGovernor,
};
use crate::gov::job::{drain_pipe, Job, JobLimits, JobSpawner, JobStatus, ProcessInspector};
use crate::gov::metrics::SystemMetrics;
use nix::sys::signal::Signal;
use std::collections::{HashMap, VecDeque};

const DEFAULT_RETAINED_FINISHED_JOBS: usize = 512;

/// Runner-side limits, distinct from the governor's admission policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePolicy {
    pub max_concurrent_jobs: usize,
    pub max_queue_depth: usize,
    pub max_processes_per_job: i32,
    pub kill_grace_ms: u64,
    pub max_job_starts_per_tick: usize,
    pub max_job_scans_per_tick: usize,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            max_queue_depth: 100,
            max_processes_per_job: 64,
            kill_grace_ms: 2000,
            max_job_starts_per_tick: 5,
            max_job_scans_per_tick: 10,
        }
    }
}

/// Snapshot published after every tick; single-writer, read by the daemon.
#[derive(Debug, Clone)]
pub struct TickDiagnostics {
    pub now_ms: u64,
    pub decision: GovernorDecision,
    pub block_reason: BlockReason,
    pub retry_after_ms: u64,
    pub running_count: usize,
    pub queued_count: usize,
    pub jobs_started_this_tick: usize,
    pub jobs_scanned_this_tick: usize,
    pub scan_cursor_position: usize,
}

impl Default for TickDiagnostics {
    fn default() -> Self {
        Self {
            now_ms: 0,
            decision: GovernorDecision::StartNow,
            block_reason: BlockReason::None,
            retry_after_ms: 0,
            running_count: 0,
            queued_count: 0,
            jobs_started_this_tick: 0,
            jobs_scanned_this_tick: 0,
            scan_cursor_position: 0,
        }
    }
}

pub struct JobRunner {
    policy: ResourcePolicy,
    governor: ResourceGovernor,
    spawner: Box<dyn JobSpawner>,
    inspector: Box<dyn ProcessInspector>,
    jobs: HashMap<String, Job>,
    /// Submission order; the scan cursor indexes into this.
    order: Vec<String>,
    pending: VecDeque<String>,
    scan_cursor: usize,
    next_job_seq: u64,
    last_tick_ms: Option<u64>,
    diagnostics: TickDiagnostics,
    rejected_jobs: u64,
    retained_finished_jobs: usize,
}

impl JobRunner {
    pub fn new(
        policy: ResourcePolicy,
        governor_policy: GovernorPolicy,
        spawner: Box<dyn JobSpawner>,
        inspector: Box<dyn ProcessInspector>,
    ) -> Self {
        Self {
            policy,
            governor: ResourceGovernor::new(governor_policy),
            spawner,
            inspector,
            jobs: HashMap::new(),
            order: Vec::new(),
            pending: VecDeque::new(),
            scan_cursor: 0,
            next_job_seq: 0,
            last_tick_ms: None,
            diagnostics: TickDiagnostics::default(),
            rejected_jobs: 0,
            retained_finished_jobs: DEFAULT_RETAINED_FINISHED_JOBS,
        }
    }

    fn next_job_id(&mut self) -> String {
        self.next_job_seq += 1;
        format!("job_{}", self.next_job_seq)
    }

    /// Unconditional enqueue; admission against the governor happens in
    /// `try_submit`.
    pub fn submit(&mut self, command: &str, limits: JobLimits, now_ms: u64) -> String {
        let id = self.next_job_id();
        let job = Job::new(id.clone(), command.to_string(), limits, now_ms);
        self.jobs.insert(id.clone(), job);
        self.order.push(id.clone());
        self.pending.push_back(id.clone());
        id
    }

    /// Submission-time admission: the governor sees the queue as it is before
    /// this job joins it. A reject leaves no trace except the counter.
    pub fn try_submit(
        &mut self,
        command: &str,
        limits: JobLimits,
        now_ms: u64,
        cpu_pct: f64,
        mem_pct: f64,
    ) -> Result<String, GovernorResult> {
        let verdict = self.governor.decide(
            cpu_pct,
            mem_pct,
            self.running_count() as i32,
            self.queued_count() as i32,
        );
        if verdict.decision == GovernorDecision::RejectQueueFull {
            self.rejected_jobs += 1;
            return Err(verdict);
        }
        Ok(self.submit(command, limits, now_ms))
    }

    pub fn running_count(&self) -> usize {
        self.jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .count()
    }

    pub fn queued_count(&self) -> usize {
        self.pending
            .iter()
            .filter(|id| {
                self.jobs
                    .get(*id)
                    .is_some_and(|j| j.status == JobStatus::Pending)
            })
            .count()
    }

    pub fn rejected_jobs(&self) -> u64 {
        self.rejected_jobs
    }

    pub fn diagnostics(&self) -> &TickDiagnostics {
        &self.diagnostics
    }

    pub fn governor_policy(&self) -> &GovernorPolicy {
        self.governor.policy()
    }

    /// Governor policy update; on success the runner's concurrency ceiling
    /// follows `max_running_jobs`.
    pub fn update_governor_policy(&mut self, policy: GovernorPolicy) -> PolicyUpdateResult {
        let result = self.governor.validate_and_update(policy);
        if result.success {
            self.policy.max_concurrent_jobs = result.effective_policy.max_running_jobs as usize;
            self.policy.max_queue_depth = result.effective_policy.max_queue_depth as usize;
        }
        result
    }

    pub fn resource_policy(&self) -> &ResourcePolicy {
        &self.policy
    }

    pub fn update_policy(&mut self, policy: ResourcePolicy) {
        self.policy = policy;
    }

    pub fn get_job(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    /// Most recent jobs first, bounded by `limit`.
    pub fn recent_jobs(&self, limit: usize) -> Vec<&Job> {
        self.order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| self.jobs.get(id))
            .collect()
    }

    /// Cancel a job. Pending and Running jobs latch `Cancelled`; terminal
    /// jobs (and unknown ids) return false.
    pub fn cancel(&mut self, id: &str, now_ms: u64) -> bool {
        let Some(job) = self.jobs.get_mut(id) else {
            return false;
        };
        match job.status {
            JobStatus::Pending => {
                job.status = JobStatus::Cancelled;
                job.finished_at_ms = now_ms;
                job.close_pipes();
                true
            }
            JobStatus::Running => {
                job.status = JobStatus::Cancelled;
                job.finished_at_ms = now_ms;
                job.kill_signal_sent = true;
                job.sigterm_sent_at_ms = now_ms;
                job.close_pipes();
                self.spawner.kill_group(job.pgid, Signal::SIGTERM);
                true
            }
            _ => false,
        }
    }

    /// One supervision step. Starts at most `max_job_starts_per_tick` pending
    /// jobs, scans at most `max_job_scans_per_tick` positions from the
    /// cursor, then publishes diagnostics.
    pub fn tick(&mut self, now_ms: u64, metrics: &SystemMetrics) {
        if self.last_tick_ms == Some(now_ms) {
            return;
        }
        self.last_tick_ms = Some(now_ms);

        let cpu_pct = metrics.cpu_usage_percent;
        let mem_pct = metrics.mem_usage_percent();

        // Start phase. Everything in the pending queue has already been
        // admitted, so the consult passes zero queued: REJECT_QUEUE_FULL is a
        // submission-time verdict and must not wedge a full queue shut.
        let mut running = self.running_count();
        let mut started = 0usize;
        let gate = self.governor.decide(cpu_pct, mem_pct, running as i32, 0);
        if gate.decision == GovernorDecision::StartNow {
            while started < self.policy.max_job_starts_per_tick
                && running < self.policy.max_concurrent_jobs
            {
                let Some(id) = self.pending.pop_front() else {
                    break;
                };
                let Some(job) = self.jobs.get_mut(&id) else {
                    continue;
                };
                if job.status != JobStatus::Pending {
                    // Cancelled while queued; drop silently.
                    continue;
                }
                started += 1;
                match self.spawner.spawn_job(&job.command) {
                    Ok(spawned) => {
                        job.status = JobStatus::Running;
                        job.pgid = spawned.pgid;
                        job.started_at_ms = now_ms;
                        job.stdout_pipe = spawned.stdout;
                        job.stderr_pipe = spawned.stderr;
                        running += 1;
                    }
                    Err(e) => {
                        job.status = JobStatus::Failed;
                        job.finished_at_ms = now_ms;
                        job.error.extend_from_slice(format!("{e:#}").as_bytes());
                        job.close_pipes();
                    }
                }
            }
        }

        // Scan phase: walk up to the scan budget of positions from the
        // cursor, wrapping through the job list.
        let total = self.order.len();
        let mut scanned = 0usize;
        if total > 0 {
            self.scan_cursor %= total;
            let budget = self.policy.max_job_scans_per_tick.min(total);
            for i in 0..budget {
                let idx = (self.scan_cursor + i) % total;
                let id = self.order[idx].clone();
                scanned += 1;
                if let Some(job) = self.jobs.get_mut(&id) {
                    scan_one(
                        job,
                        now_ms,
                        &self.policy,
                        self.spawner.as_mut(),
                        self.inspector.as_mut(),
                    );
                }
            }
            self.scan_cursor = (self.scan_cursor + scanned) % total;
        }

        self.evict_old_finished();

        let running_post = self.running_count();
        let queued_post = self.queued_count();
        let snapshot = self
            .governor
            .decide(cpu_pct, mem_pct, running_post as i32, queued_post as i32);
        self.diagnostics = TickDiagnostics {
            now_ms,
            decision: snapshot.decision,
            block_reason: snapshot.reason,
            retry_after_ms: snapshot.retry_after_ms,
            running_count: running_post,
            queued_count: queued_post,
            jobs_started_this_tick: started,
            jobs_scanned_this_tick: scanned,
            scan_cursor_position: self.scan_cursor,
        };
    }

    /// Final pass at shutdown: reap what already exited and release pipe fds
    /// of terminal jobs. Does not signal anything.
    pub fn drain(&mut self, now_ms: u64) {
        let ids: Vec<String> = self.order.clone();
        for id in ids {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            if job.status == JobStatus::Running {
                if let Some(code) = self.spawner.try_wait(job.pgid) {
                    finish_with_exit(job, code, now_ms);
                }
            }
            if job.is_terminal() {
                job.close_pipes();
            }
        }
    }

    /// Terminal jobs beyond the retention window are destroyed oldest-first.
    fn evict_old_finished(&mut self) {
        let mut finished = self
            .order
            .iter()
            .filter(|id| self.jobs.get(*id).is_some_and(|j| j.is_terminal()))
            .count();
        while finished > self.retained_finished_jobs {
            let Some(pos) = self
                .order
                .iter()
                .position(|id| self.jobs.get(id).is_some_and(|j| j.is_terminal()))
            else {
                break;
            };
            let id = self.order.remove(pos);
            self.jobs.remove(&id);
            if pos < self.scan_cursor {
                self.scan_cursor -= 1;
            }
            finished -= 1;
        }
        if self.order.is_empty() {
            self.scan_cursor = 0;
        } else {
            self.scan_cursor %= self.order.len();
        }
    }

    #[cfg(test)]
    fn set_retention_for_test(&mut self, n: usize) {
        self.retained_finished_jobs = n;
    }

    #[cfg(test)]
    fn job_mut(&mut self, id: &str) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }
}

fn finish_with_exit(job: &mut Job, code: i32, now_ms: u64) {
    if let Some(fd) = &job.stdout_pipe {
        job.bytes_written += drain_pipe(fd, &mut job.output);
    }
    if let Some(fd) = &job.stderr_pipe {
        job.bytes_written += drain_pipe(fd, &mut job.error);
    }
    job.exit_code = code;
    job.status = if code == 0 {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    };
    job.finished_at_ms = now_ms;
    job.close_pipes();
}

fn truncate_keep_tail(buf: &mut Vec<u8>, keep: usize) {
    if buf.len() > keep {
        let cut = buf.len() - keep;
        buf.drain(..cut);
    }
}

/// Per-job supervision step: completion, runtime ceiling, log ceiling,
/// process-count ceiling, kill escalation. The first terminal transition
/// latches the status; escalation never regresses it.
fn scan_one(
    job: &mut Job,
    now_ms: u64,
    policy: &ResourcePolicy,
    spawner: &mut dyn JobSpawner,
    inspector: &mut dyn ProcessInspector,
) {
    if job.status == JobStatus::Running {
        job.last_scanned_at_ms = now_ms;

        if let Some(code) = spawner.try_wait(job.pgid) {
            finish_with_exit(job, code, now_ms);
            return;
        }

        if let Some(fd) = &job.stdout_pipe {
            job.bytes_written += drain_pipe(fd, &mut job.output);
        }
        if let Some(fd) = &job.stderr_pipe {
            job.bytes_written += drain_pipe(fd, &mut job.error);
        }

        if now_ms.saturating_sub(job.started_at_ms) > job.limits.max_runtime_ms {
            spawner.kill_group(job.pgid, Signal::SIGTERM);
            job.status = JobStatus::Timeout;
            job.finished_at_ms = now_ms;
            job.kill_signal_sent = true;
            job.sigterm_sent_at_ms = now_ms;
            job.close_pipes();
            return;
        }

        let log_total = (job.output.len() + job.error.len()) as u64;
        if log_total > job.limits.max_log_bytes {
            let keep = (job.limits.max_log_bytes / 2) as usize;
            truncate_keep_tail(&mut job.output, keep);
            truncate_keep_tail(&mut job.error, keep);
            job.log_truncated = true;
            job.bytes_written = job.bytes_written.min(job.limits.max_log_bytes);
        }

        let proc_limit = job.limits.max_child_processes.min(policy.max_processes_per_job);
        if !job.kill_signal_sent {
            let count = inspector.count_in_pgid(job.pgid);
            if count > proc_limit {
                spawner.kill_group(job.pgid, Signal::SIGTERM);
                job.kill_signal_sent = true;
                job.sigterm_sent_at_ms = now_ms;
            }
        }
    }

    // Kill escalation runs for Running jobs and for jobs already latched
    // terminal (Timeout, Cancelled) whose group is still draining.
    if job.kill_signal_sent
        && !job.sigkill_sent
        && now_ms.saturating_sub(job.sigterm_sent_at_ms) >= policy.kill_grace_ms
    {
        spawner.kill_group(job.pgid, Signal::SIGKILL);
        job.sigkill_sent = true;
        if job.status == JobStatus::Running {
            job.status = JobStatus::ProcLimit;
            job.finished_at_ms = now_ms;
            job.close_pipes();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeState {
        next_pgid: i32,
        spawned: Vec<String>,
        killed: Vec<(i32, Signal)>,
        completions: HashMap<i32, i32>,
        proc_counts: HashMap<i32, i32>,
        fail_spawn: bool,
    }

    #[derive(Clone)]
    struct FakeSpawner(Arc<Mutex<FakeState>>);

    impl JobSpawner for FakeSpawner {
        fn spawn_job(&mut self, command: &str) -> anyhow::Result<crate::gov::job::SpawnedJob> {
            let mut st = self.0.lock().unwrap();
            if st.fail_spawn {
                anyhow::bail!("injected spawn failure");
            }
            st.next_pgid += 1;
            let pgid = 1000 + st.next_pgid;
            st.spawned.push(command.to_string());
            Ok(crate::gov::job::SpawnedJob {
                pgid,
                stdout: None,
                stderr: None,
            })
        }

        fn try_wait(&mut self, pgid: i32) -> Option<i32> {
            self.0.lock().unwrap().completions.remove(&pgid)
        }

        fn kill_group(&mut self, pgid: i32, signal: Signal) {
            self.0.lock().unwrap().killed.push((pgid, signal));
        }
    }

    #[derive(Clone)]
    struct FakeInspector(Arc<Mutex<FakeState>>);

    impl ProcessInspector for FakeInspector {
        fn count_in_pgid(&mut self, pgid: i32) -> i32 {
            self.0
                .lock()
                .unwrap()
                .proc_counts
                .get(&pgid)
                .copied()
                .unwrap_or(1)
        }
    }

    fn runner_with(
        policy: ResourcePolicy,
        governor: GovernorPolicy,
    ) -> (JobRunner, Arc<Mutex<FakeState>>) {
        let state = Arc::new(Mutex::new(FakeState::default()));
        let runner = JobRunner::new(
            policy,
            governor,
            Box::new(FakeSpawner(Arc::clone(&state))),
            Box::new(FakeInspector(Arc::clone(&state))),
        );
        (runner, state)
    }

    fn idle_metrics() -> SystemMetrics {
        SystemMetrics {
            cpu_usage_percent: 10.0,
            mem: crate::gov::metrics::MemStats {
                total: 100,
                free: 50,
                available: 50,
                ..Default::default()
            },
            timestamp: 0,
        }
    }

    #[test]
    fn queue_full_rejects_third_submission() {
        let governor = GovernorPolicy {
            max_queue_depth: 2,
            ..Default::default()
        };
        let (mut runner, _state) = runner_with(ResourcePolicy::default(), governor);

        assert!(runner
            .try_submit("sleep 1", JobLimits::default(), 0, 10.0, 50.0)
            .is_ok());
        assert!(runner
            .try_submit("sleep 1", JobLimits::default(), 0, 10.0, 50.0)
            .is_ok());
        let rejected = runner
            .try_submit("sleep 1", JobLimits::default(), 0, 10.0, 50.0)
            .unwrap_err();
        assert_eq!(rejected.decision, GovernorDecision::RejectQueueFull);
        assert_eq!(rejected.reason, BlockReason::QueueFull);
        assert_eq!(rejected.retry_after_ms, 1000);
        assert_eq!(runner.rejected_jobs(), 1);

        runner.tick(1, &idle_metrics());
        assert_eq!(runner.running_count(), 2);
        assert_eq!(runner.diagnostics().jobs_started_this_tick, 2);
    }

    #[test]
    fn running_cap_holds_queue() {
        let governor = GovernorPolicy {
            max_running_jobs: 2,
            ..Default::default()
        };
        let (mut runner, _state) = runner_with(ResourcePolicy::default(), governor);
        // The runner's concurrency ceiling follows the governor policy.
        let update = runner.update_governor_policy(GovernorPolicy {
            max_running_jobs: 2,
            ..Default::default()
        });
        assert!(update.success);

        for _ in 0..5 {
            runner.submit("sleep 1", JobLimits::default(), 0);
        }
        runner.tick(1, &idle_metrics());

        assert_eq!(runner.running_count(), 2);
        assert_eq!(runner.queued_count(), 3);
        let d = runner.diagnostics();
        assert_eq!(d.decision, GovernorDecision::HoldQueue);
        assert_eq!(d.block_reason, BlockReason::RunningLimit);
        assert_eq!(d.jobs_started_this_tick, 2);
    }

    #[test]
    fn timeout_latches_and_escalates() {
        let (mut runner, state) = runner_with(ResourcePolicy::default(), GovernorPolicy::default());
        let limits = JobLimits {
            max_runtime_ms: 100,
            ..Default::default()
        };
        let id = runner.submit("sleep 60", limits, 0);
        runner.tick(0, &idle_metrics());
        assert_eq!(runner.get_job(&id).unwrap().status, JobStatus::Running);
        let pgid = runner.get_job(&id).unwrap().pgid;

        runner.tick(101, &idle_metrics());
        let job = runner.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Timeout);
        assert_eq!(job.finished_at_ms, 101);
        assert!(job.kill_signal_sent);
        assert_eq!(state.lock().unwrap().killed, vec![(pgid, Signal::SIGTERM)]);

        // Kill grace elapses: SIGKILL goes out, status stays Timeout.
        runner.tick(101 + 2000, &idle_metrics());
        let job = runner.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Timeout);
        assert_eq!(
            state.lock().unwrap().killed,
            vec![(pgid, Signal::SIGTERM), (pgid, Signal::SIGKILL)]
        );
    }

    #[test]
    fn process_cap_escalates_to_proc_limit() {
        let policy = ResourcePolicy {
            max_processes_per_job: 10,
            ..Default::default()
        };
        let (mut runner, state) = runner_with(policy, GovernorPolicy::default());
        let id = runner.submit("forkstorm", JobLimits::default(), 0);
        runner.tick(0, &idle_metrics());
        let pgid = runner.get_job(&id).unwrap().pgid;

        state.lock().unwrap().proc_counts.insert(pgid, 11);
        runner.tick(1, &idle_metrics());
        let job = runner.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.kill_signal_sent);
        assert_eq!(job.sigterm_sent_at_ms, 1);
        assert_eq!(state.lock().unwrap().killed, vec![(pgid, Signal::SIGTERM)]);

        runner.tick(1 + 2000 + 1, &idle_metrics());
        let job = runner.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::ProcLimit);
        assert_eq!(job.finished_at_ms, 2002);
        assert_eq!(
            state.lock().unwrap().killed,
            vec![(pgid, Signal::SIGTERM), (pgid, Signal::SIGKILL)]
        );
    }

    #[test]
    fn start_and_scan_budgets_hold() {
        let policy = ResourcePolicy {
            max_job_starts_per_tick: 5,
            max_job_scans_per_tick: 3,
            max_concurrent_jobs: 100,
            ..Default::default()
        };
        let (mut runner, _state) = runner_with(
            policy,
            GovernorPolicy {
                max_running_jobs: 100,
                ..Default::default()
            },
        );
        for _ in 0..12 {
            runner.submit("sleep 1", JobLimits::default(), 0);
        }

        runner.tick(1, &idle_metrics());
        let d = runner.diagnostics();
        assert_eq!(d.jobs_started_this_tick, 5);
        assert!(d.jobs_scanned_this_tick <= 3);
        assert_eq!(runner.running_count(), 5);

        runner.tick(2, &idle_metrics());
        assert_eq!(runner.running_count(), 10);
        runner.tick(3, &idle_metrics());
        assert_eq!(runner.running_count(), 12);
    }

    #[test]
    fn scan_cursor_wraps_and_stays_in_range() {
        let policy = ResourcePolicy {
            max_job_scans_per_tick: 4,
            ..Default::default()
        };
        let (mut runner, _state) = runner_with(policy, GovernorPolicy::default());
        for _ in 0..6 {
            runner.submit("sleep 1", JobLimits::default(), 0);
        }
        let mut now = 0;
        for _ in 0..10 {
            now += 1;
            runner.tick(now, &idle_metrics());
            let d = runner.diagnostics();
            assert!(d.scan_cursor_position < 6);
            assert_eq!(d.jobs_scanned_this_tick, 4);
        }
        // 10 ticks x 4 scans over 6 jobs: cursor at (40 mod 6).
        assert_eq!(runner.diagnostics().scan_cursor_position, 40 % 6);
    }

    #[test]
    fn tick_at_same_timestamp_is_a_noop() {
        let (mut runner, _state) = runner_with(ResourcePolicy::default(), GovernorPolicy::default());
        for _ in 0..8 {
            runner.submit("sleep 1", JobLimits::default(), 0);
        }
        runner.tick(5, &idle_metrics());
        assert_eq!(runner.running_count(), 5);
        // Same timestamp: no further starts, no diagnostics change.
        runner.tick(5, &idle_metrics());
        assert_eq!(runner.running_count(), 5);
        assert_eq!(runner.diagnostics().jobs_started_this_tick, 5);
        runner.tick(6, &idle_metrics());
        assert_eq!(runner.running_count(), 8);
    }

    #[test]
    fn completion_records_exit_code() {
        let (mut runner, state) = runner_with(ResourcePolicy::default(), GovernorPolicy::default());
        let ok_id = runner.submit("true", JobLimits::default(), 0);
        let bad_id = runner.submit("false", JobLimits::default(), 0);
        runner.tick(1, &idle_metrics());

        let ok_pgid = runner.get_job(&ok_id).unwrap().pgid;
        let bad_pgid = runner.get_job(&bad_id).unwrap().pgid;
        {
            let mut st = state.lock().unwrap();
            st.completions.insert(ok_pgid, 0);
            st.completions.insert(bad_pgid, 7);
        }
        runner.tick(2, &idle_metrics());

        let ok_job = runner.get_job(&ok_id).unwrap();
        assert_eq!(ok_job.status, JobStatus::Completed);
        assert_eq!(ok_job.exit_code, 0);
        assert_eq!(ok_job.finished_at_ms, 2);
        let bad_job = runner.get_job(&bad_id).unwrap();
        assert_eq!(bad_job.status, JobStatus::Failed);
        assert_eq!(bad_job.exit_code, 7);
    }

    #[test]
    fn spawn_failure_marks_job_failed() {
        let (mut runner, state) = runner_with(ResourcePolicy::default(), GovernorPolicy::default());
        state.lock().unwrap().fail_spawn = true;
        let id = runner.submit("whatever", JobLimits::default(), 0);
        runner.tick(1, &idle_metrics());
        let job = runner.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.finished_at_ms, 1);
        assert!(!job.error.is_empty());
    }

    #[test]
    fn log_cap_truncates_to_half_each() {
        let (mut runner, _state) = runner_with(ResourcePolicy::default(), GovernorPolicy::default());
        let limits = JobLimits {
            max_log_bytes: 64,
            ..Default::default()
        };
        let id = runner.submit("yes", limits, 0);
        runner.tick(1, &idle_metrics());
        {
            let job = runner.job_mut(&id).unwrap();
            job.output = vec![b'a'; 60];
            job.error = vec![b'b'; 60];
            job.bytes_written = 120;
        }
        // Scan budget covers the single job on the next tick.
        runner.tick(2, &idle_metrics());
        let job = runner.get_job(&id).unwrap();
        assert!(job.log_truncated);
        assert_eq!(job.output.len(), 32);
        assert_eq!(job.error.len(), 32);
        assert!(job.bytes_written <= 64);
        assert_eq!(job.status, JobStatus::Running);
    }

    #[test]
    fn cancel_pending_and_running() {
        let (mut runner, state) = runner_with(ResourcePolicy::default(), GovernorPolicy::default());
        let running_id = runner.submit("sleep 60", JobLimits::default(), 0);
        runner.tick(1, &idle_metrics());
        let pending_id = runner.submit("sleep 60", JobLimits::default(), 1);

        assert!(runner.cancel(&pending_id, 2));
        assert_eq!(
            runner.get_job(&pending_id).unwrap().status,
            JobStatus::Cancelled
        );

        let pgid = runner.get_job(&running_id).unwrap().pgid;
        assert!(runner.cancel(&running_id, 3));
        let job = runner.get_job(&running_id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.kill_signal_sent);
        assert_eq!(state.lock().unwrap().killed, vec![(pgid, Signal::SIGTERM)]);

        // Terminal: cancelling again fails, unknown ids fail.
        assert!(!runner.cancel(&running_id, 4));
        assert!(!runner.cancel("job_999", 4));

        // Escalation still fires for the cancelled group; status stays latched.
        runner.tick(3 + 2000, &idle_metrics());
        assert_eq!(
            runner.get_job(&running_id).unwrap().status,
            JobStatus::Cancelled
        );
        assert!(state
            .lock()
            .unwrap()
            .killed
            .contains(&(pgid, Signal::SIGKILL)));
        // A cancelled pending job never reaches the spawner.
        runner.tick(3000, &idle_metrics());
        assert_eq!(
            runner.get_job(&pending_id).unwrap().status,
            JobStatus::Cancelled
        );
        assert_eq!(state.lock().unwrap().spawned.len(), 1);
    }

    #[test]
    fn transition_sequences_are_deterministic() {
        let run_once = || {
            let (mut runner, state) =
                runner_with(ResourcePolicy::default(), GovernorPolicy::default());
            let a = runner.submit("a", JobLimits::default(), 0);
            let b = runner.submit(
                "b",
                JobLimits {
                    max_runtime_ms: 50,
                    ..Default::default()
                },
                0,
            );
            runner.tick(1, &idle_metrics());
            let a_pgid = runner.get_job(&a).unwrap().pgid;
            state.lock().unwrap().completions.insert(a_pgid, 0);
            runner.tick(60, &idle_metrics());
            runner.tick(2100, &idle_metrics());
            let result = (
                runner.get_job(&a).unwrap().status,
                runner.get_job(&b).unwrap().status,
                state.lock().unwrap().killed.clone(),
            );
            result
        };
        assert_eq!(run_once(), run_once());
    }

    #[test]
    fn finished_jobs_evicted_past_retention_window() {
        let (mut runner, state) = runner_with(
            ResourcePolicy {
                max_job_scans_per_tick: 16,
                ..Default::default()
            },
            GovernorPolicy::default(),
        );
        runner.set_retention_for_test(3);

        let mut ids = Vec::new();
        let mut now = 0;
        for i in 0..6 {
            now += 1;
            let id = runner.submit(&format!("job {i}"), JobLimits::default(), now);
            runner.tick(now, &idle_metrics());
            let pgid = runner.get_job(&id).unwrap().pgid;
            state.lock().unwrap().completions.insert(pgid, 0);
            now += 1;
            runner.tick(now, &idle_metrics());
            assert_eq!(runner.get_job(&id).unwrap().status, JobStatus::Completed);
            ids.push(id);
        }

        // Only the newest three terminal jobs survive.
        assert!(runner.get_job(&ids[0]).is_none());
        assert!(runner.get_job(&ids[1]).is_none());
        assert!(runner.get_job(&ids[2]).is_none());
        assert!(runner.get_job(&ids[5]).is_some());
        assert!(runner.diagnostics().scan_cursor_position < 3 || runner.recent_jobs(10).len() == 3);
    }

    #[test]
    fn watermarks_hold_the_start_phase() {
        let (mut runner, _state) = runner_with(ResourcePolicy::default(), GovernorPolicy::default());
        runner.submit("sleep 1", JobLimits::default(), 0);
        let hot = SystemMetrics {
            cpu_usage_percent: 95.0,
            mem: crate::gov::metrics::MemStats {
                total: 100,
                free: 50,
                available: 50,
                ..Default::default()
            },
            timestamp: 0,
        };
        runner.tick(1, &hot);
        assert_eq!(runner.running_count(), 0);
        let d = runner.diagnostics();
        assert_eq!(d.decision, GovernorDecision::HoldQueue);
        assert_eq!(d.block_reason, BlockReason::CpuHigh);
        assert_eq!(d.jobs_started_this_tick, 0);

        // Pressure clears: the held job starts on the next tick.
        runner.tick(2, &idle_metrics());
        assert_eq!(runner.running_count(), 1);
    }
}
