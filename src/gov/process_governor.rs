//! Rule-application pipeline: a bounded ingress queue drained by a single
//! apply worker, with an epoll watcher turning pidfd exits into events.
//!
//! Per-message errors never unwind the worker; they are counted, recorded in
//! `last_err`, and reported through the event callback. The only fatal error
//! is failing to create the epoll fd at startup.

use crate::gov::appliers::{self, ApplyOutcome};
use crate::gov::cgroup::{CgroupCaps, CgroupDriver};
use crate::gov::group_store::{GroupPolicyStore, StoreStats};
use crate::gov::pidtrack::PidTracker;
use crate::gov::rule::{ApplyFields, GovApplyMsg};
use nix::errno::Errno;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const QUEUE_CAPACITY: usize = 256;
const CGROUP_UNAVAILABLE_RATE_LIMIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovEventType {
    ApplySuccess,
    ApplyFailure,
    PidExit,
    PidEvicted,
    GroupEvicted,
    PidmapEvicted,
    CgroupUnavailable,
}

impl GovEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GovEventType::ApplySuccess => "APPLY_SUCCESS",
            GovEventType::ApplyFailure => "APPLY_FAILURE",
            GovEventType::PidExit => "PID_EXIT",
            GovEventType::PidEvicted => "PID_EVICTED",
            GovEventType::GroupEvicted => "GROUP_EVICTED",
            GovEventType::PidmapEvicted => "PIDMAP_EVICTED",
            GovEventType::CgroupUnavailable => "CGROUP_UNAVAILABLE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GovEvent {
    pub event: GovEventType,
    pub pid: i32,
    pub errno: i32,
    pub applied: ApplyFields,
}

pub type EventCallback = Box<dyn Fn(&GovEvent) + Send + Sync>;

/// Controllers the cgroup driver committed, expressed in the policy-schema
/// bitmask the APPLY_SUCCESS event reports.
fn cgroup_applied_fields(caps: CgroupCaps) -> ApplyFields {
    let mut fields = ApplyFields::default();
    if caps.has(CgroupCaps::CPU) {
        fields.set(ApplyFields::CPU_MAX_PCT);
    }
    if caps.has(CgroupCaps::MEMORY) {
        fields.set(ApplyFields::MEM_MAX_BYTES);
    }
    if caps.has(CgroupCaps::PIDS) {
        fields.set(ApplyFields::PIDS_MAX);
    }
    fields
}

#[derive(Debug, Clone, Default)]
pub struct GovStats {
    pub messages_processed: u64,
    pub messages_failed: u64,
    pub messages_dropped: u64,
    pub last_err: i32,
    pub last_err_detail: String,
    pub rules_count: usize,
    pub tracked_pids: usize,
    pub queue_depth: usize,
    pub pid_exit_events: u64,
    pub evicted_events: u64,
    pub group_evictions: u64,
    pub pidmap_evictions: u64,
    pub cgroup_unavailable_events: u64,
}

#[derive(Default)]
struct StatsInner {
    messages_processed: u64,
    messages_failed: u64,
    messages_dropped: u64,
    last_err: i32,
    last_err_detail: String,
    pid_exit_events: u64,
    evicted_events: u64,
    cgroup_unavailable_events: u64,
}

struct Inner {
    queue: Mutex<VecDeque<GovApplyMsg>>,
    queue_cv: Condvar,
    running: AtomicBool,
    tracker: PidTracker,
    rules: Mutex<HashMap<i32, GovApplyMsg>>,
    group_store: Mutex<GroupPolicyStore>,
    cgroup: CgroupDriver,
    stats: Mutex<StatsInner>,
    callback: Mutex<Option<EventCallback>>,
    last_cgroup_unavailable: Mutex<Option<Instant>>,
}

impl Inner {
    fn emit(&self, event: GovEvent) {
        let cb = self.callback.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(cb) = cb.as_ref() {
            cb(&event);
        }
    }

    fn emit_simple(&self, event: GovEventType, pid: i32, errno: i32) {
        self.emit(GovEvent {
            event,
            pid,
            errno,
            applied: ApplyFields::default(),
        });
    }

    /// Drop every record of a pid that is known gone.
    fn forget_pid(&self, pid: i32) {
        self.rules
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&pid);
        self.group_store
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove_pid(pid);
        self.cgroup.cleanup(pid);
    }

    fn note_pid_exit(&self, pid: i32) {
        self.forget_pid(pid);
        {
            let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
            stats.pid_exit_events += 1;
        }
        self.emit_simple(GovEventType::PidExit, pid, 0);
    }

    fn apply_group_policy(&self, pid: i32, msg: &GovApplyMsg) -> ApplyOutcome {
        let Some(group) = &msg.group else {
            return ApplyOutcome {
                ok: true,
                ..Default::default()
            };
        };

        let (policy, before, after) = {
            let mut store = self.group_store.lock().unwrap_or_else(|p| p.into_inner());
            let before = store.stats();
            if !store.upsert_group(group, msg) {
                return ApplyOutcome {
                    ok: false,
                    errno: Errno::EINVAL as i32,
                    detail: format!("malformed group id: {group}"),
                    ..Default::default()
                };
            }
            store.map_pid_to_group(pid, group);
            let after = store.stats();
            let policy = store
                .get_group_for_pid(pid)
                .and_then(|gid| store.get_group(gid))
                .cloned();
            (policy, before, after)
        };

        if after.group_evictions > before.group_evictions {
            let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
            stats.evicted_events += 1;
            drop(stats);
            self.emit_simple(GovEventType::GroupEvicted, pid, 0);
        }
        if after.pidmap_evictions > before.pidmap_evictions {
            let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
            stats.evicted_events += 1;
            drop(stats);
            self.emit_simple(GovEventType::PidmapEvicted, pid, 0);
        }

        let Some(policy) = policy else {
            return ApplyOutcome {
                ok: true,
                ..Default::default()
            };
        };
        if !policy.has_any_policy() {
            return ApplyOutcome {
                ok: true,
                ..Default::default()
            };
        }

        if !self.cgroup.is_available() {
            self.note_cgroup_unavailable(pid);
            return ApplyOutcome {
                ok: true,
                ..Default::default()
            };
        }

        let cg = self.cgroup.apply(pid, &policy);
        if !cg.ok {
            return ApplyOutcome {
                ok: false,
                errno: cg.errno,
                detail: cg.detail,
                ..Default::default()
            };
        }
        ApplyOutcome {
            ok: true,
            applied: cgroup_applied_fields(cg.applied),
            ..Default::default()
        }
    }

    fn note_cgroup_unavailable(&self, pid: i32) {
        let mut last = self
            .last_cgroup_unavailable
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        if last.is_some_and(|t| now.duration_since(t) < CGROUP_UNAVAILABLE_RATE_LIMIT) {
            return;
        }
        *last = Some(now);
        drop(last);
        {
            let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
            stats.cgroup_unavailable_events += 1;
        }
        self.emit_simple(GovEventType::CgroupUnavailable, pid, 0);
    }

    /// Fixed order: group/cgroup, then affinity, nice, rlimit, oom_score_adj.
    /// The order is part of the contract; reapplying the same message must
    /// traverse the same sequence.
    fn apply_rules(&self, pid: i32, msg: &GovApplyMsg) -> ApplyOutcome {
        let mut result = ApplyOutcome {
            ok: true,
            ..Default::default()
        };

        if msg.group.is_some() {
            let r = self.apply_group_policy(pid, msg);
            if !r.ok {
                return r;
            }
            result.applied.merge(r.applied);
        }

        if let Some(cpu) = &msg.cpu {
            if let Some(affinity) = &cpu.affinity {
                let r = appliers::apply_affinity(pid, affinity);
                if !r.ok {
                    return r;
                }
                result.applied.merge(r.applied);
            }
            if let Some(nice) = cpu.nice {
                let r = appliers::apply_nice(pid, nice);
                if !r.ok {
                    return r;
                }
                result.applied.merge(r.applied);
            }
        }

        if let Some(rlim) = &msg.rlim {
            let r = appliers::apply_rlimit(pid, rlim);
            if !r.ok {
                return r;
            }
            result.applied.merge(r.applied);
        }

        if let Some(adj) = msg.oom_score_adj {
            let r = appliers::apply_oom_score_adj(pid, adj);
            if !r.ok {
                return r;
            }
            result.applied.merge(r.applied);
        }

        result
    }

    fn process_one(&self, msg: GovApplyMsg) {
        for pid in self.tracker.cleanup_dead() {
            self.note_pid_exit(pid);
        }

        let tracked = self.tracker.track(msg.pid);
        if let Some(evicted) = tracked.evicted {
            self.forget_pid(evicted);
            {
                let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
                stats.evicted_events += 1;
            }
            self.emit_simple(GovEventType::PidEvicted, evicted, 0);
        }
        if !tracked.ok {
            let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
            stats.messages_failed += 1;
            stats.last_err = Errno::ESRCH as i32;
            stats.last_err_detail = format!("failed to track pid {}", msg.pid);
            drop(stats);
            self.emit_simple(GovEventType::ApplyFailure, msg.pid, Errno::ESRCH as i32);
            return;
        }

        let result = self.apply_rules(msg.pid, &msg);

        if result.ok {
            self.rules
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(msg.pid, msg.clone());
            let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
            stats.messages_processed += 1;
            drop(stats);
            self.emit(GovEvent {
                event: GovEventType::ApplySuccess,
                pid: msg.pid,
                errno: 0,
                applied: result.applied,
            });
        } else {
            let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
            stats.messages_failed += 1;
            stats.last_err = result.errno;
            stats.last_err_detail = result.detail.clone();
            drop(stats);
            self.emit(GovEvent {
                event: GovEventType::ApplyFailure,
                pid: msg.pid,
                errno: result.errno,
                applied: ApplyFields::default(),
            });
        }
    }

    fn apply_loop(&self) {
        while self.running.load(Ordering::Relaxed) {
            let msg = {
                let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
                while queue.is_empty() && self.running.load(Ordering::Relaxed) {
                    let (q, _) = self
                        .queue_cv
                        .wait_timeout(queue, Duration::from_millis(50))
                        .unwrap_or_else(|p| p.into_inner());
                    queue = q;
                }
                queue.pop_front()
            };
            let Some(msg) = msg else {
                continue;
            };
            self.process_one(msg);
        }
    }

    fn epoll_loop(&self) {
        while self.running.load(Ordering::Relaxed) {
            for pid in self.tracker.poll_exits(10) {
                self.note_pid_exit(pid);
            }
        }
    }
}

pub struct ProcessGovernor {
    inner: Arc<Inner>,
    apply_thread: Option<JoinHandle<()>>,
    epoll_thread: Option<JoinHandle<()>>,
}

impl ProcessGovernor {
    /// Fails only when the epoll fd cannot be created; the worker must not
    /// partially start in that case.
    pub fn new(cgroup: CgroupDriver) -> anyhow::Result<Self> {
        Ok(Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                queue_cv: Condvar::new(),
                running: AtomicBool::new(false),
                tracker: PidTracker::new()?,
                rules: Mutex::new(HashMap::new()),
                group_store: Mutex::new(GroupPolicyStore::new()),
                cgroup,
                stats: Mutex::new(StatsInner::default()),
                callback: Mutex::new(None),
                last_cgroup_unavailable: Mutex::new(None),
            }),
            apply_thread: None,
            epoll_thread: None,
        })
    }

    pub fn set_event_callback(&self, cb: EventCallback) {
        *self.inner.callback.lock().unwrap_or_else(|p| p.into_inner()) = Some(cb);
    }

    pub fn start(&mut self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let apply_inner = Arc::clone(&self.inner);
        self.apply_thread = Some(
            std::thread::Builder::new()
                .name("gov-apply".to_string())
                .spawn(move || apply_inner.apply_loop())
                .expect("spawn gov-apply thread"),
        );
        let epoll_inner = Arc::clone(&self.inner);
        self.epoll_thread = Some(
            std::thread::Builder::new()
                .name("gov-epoll".to_string())
                .spawn(move || epoll_inner.epoll_loop())
                .expect("spawn gov-epoll thread"),
        );
    }

    pub fn stop(&mut self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.queue_cv.notify_all();
        if let Some(t) = self.apply_thread.take() {
            let _ = t.join();
        }
        if let Some(t) = self.epoll_thread.take() {
            let _ = t.join();
        }
    }

    /// FIFO admission into the apply pipeline; false when the queue is full
    /// (surfaced to the submitter as NACK_QUEUE_FULL).
    pub fn enqueue(&self, msg: GovApplyMsg) -> bool {
        let mut queue = self.inner.queue.lock().unwrap_or_else(|p| p.into_inner());
        if queue.len() >= QUEUE_CAPACITY {
            drop(queue);
            let mut stats = self.inner.stats.lock().unwrap_or_else(|p| p.into_inner());
            stats.messages_dropped += 1;
            return false;
        }
        queue.push_back(msg);
        drop(queue);
        self.inner.queue_cv.notify_one();
        true
    }

    pub fn queue_size(&self) -> usize {
        self.inner.queue.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn queue_capacity(&self) -> usize {
        QUEUE_CAPACITY
    }

    pub fn stats(&self) -> GovStats {
        let inner = self.inner.stats.lock().unwrap_or_else(|p| p.into_inner());
        let store_stats: StoreStats = self
            .inner
            .group_store
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .stats();
        GovStats {
            messages_processed: inner.messages_processed,
            messages_failed: inner.messages_failed,
            messages_dropped: inner.messages_dropped,
            last_err: inner.last_err,
            last_err_detail: inner.last_err_detail.clone(),
            rules_count: self
                .inner
                .rules
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .len(),
            tracked_pids: self.inner.tracker.tracked_count(),
            queue_depth: self
                .inner
                .queue
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .len(),
            pid_exit_events: inner.pid_exit_events,
            evicted_events: inner.evicted_events,
            group_evictions: store_stats.group_evictions,
            pidmap_evictions: store_stats.pidmap_evictions,
            cgroup_unavailable_events: inner.cgroup_unavailable_events,
        }
    }

    pub fn last_rule_for(&self, pid: i32) -> Option<GovApplyMsg> {
        self.inner
            .rules
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&pid)
            .cloned()
    }
}

impl Drop for ProcessGovernor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gov::rule::parse_gov_apply;
    use std::sync::mpsc;

    fn unavailable_driver() -> CgroupDriver {
        let dir = tempfile::tempdir().unwrap();
        CgroupDriver::new(dir.path(), "t")
    }

    fn governor_with_events() -> (ProcessGovernor, mpsc::Receiver<GovEvent>) {
        let gov = ProcessGovernor::new(unavailable_driver()).unwrap();
        let (tx, rx) = mpsc::channel();
        gov.set_event_callback(Box::new(move |ev| {
            let _ = tx.send(ev.clone());
        }));
        (gov, rx)
    }

    #[test]
    fn enqueue_rejects_when_full() {
        let (gov, _rx) = governor_with_events();
        // Worker not started: the queue only fills.
        for pid in 1..=QUEUE_CAPACITY as i32 {
            assert!(gov.enqueue(GovApplyMsg {
                pid,
                ..Default::default()
            }));
        }
        assert!(!gov.enqueue(GovApplyMsg {
            pid: 9999,
            ..Default::default()
        }));
        assert_eq!(gov.queue_size(), QUEUE_CAPACITY);
        assert_eq!(gov.stats().messages_dropped, 1);
    }

    #[test]
    fn applies_rlimit_message_to_self() {
        let (mut gov, rx) = governor_with_events();
        gov.start();

        let me = std::process::id() as i32;
        let payload = format!("{{\"pid\":{me},\"rlim\":{{\"core_soft\":0}}}}");
        let parsed = parse_gov_apply(&payload);
        assert!(parsed.ok);
        assert!(gov.enqueue(parsed.msg));

        let ev = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ev.event, GovEventType::ApplySuccess);
        assert_eq!(ev.pid, me);
        assert!(ev.applied.has(ApplyFields::RLIM_CORE));

        let stats = gov.stats();
        assert_eq!(stats.messages_processed, 1);
        assert_eq!(stats.messages_failed, 0);
        assert_eq!(stats.rules_count, 1);
        assert!(gov.last_rule_for(me).is_some());
        gov.stop();
    }

    #[test]
    fn dead_pid_fails_with_esrch() {
        let (mut gov, rx) = governor_with_events();
        gov.start();

        let pid = 0x3fff00;
        if std::fs::metadata(format!("/proc/{pid}")).is_ok() {
            return;
        }
        assert!(gov.enqueue(GovApplyMsg {
            pid,
            ..Default::default()
        }));

        let ev = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ev.event, GovEventType::ApplyFailure);
        assert_eq!(ev.errno, Errno::ESRCH as i32);
        let stats = gov.stats();
        assert_eq!(stats.messages_failed, 1);
        assert_eq!(stats.last_err, Errno::ESRCH as i32);
        gov.stop();
    }

    #[test]
    fn group_message_without_cgroup2_reports_unavailable_once() {
        let (mut gov, rx) = governor_with_events();
        gov.start();

        let me = std::process::id() as i32;
        for _ in 0..2 {
            let parsed = parse_gov_apply(&format!(
                "{{\"pid\":{me},\"group\":\"testers\",\"mem\":{{\"max_bytes\":1048576}}}}"
            ));
            assert!(parsed.ok);
            assert!(gov.enqueue(parsed.msg));
        }

        let mut successes = 0;
        let mut unavailable = 0;
        // Two messages, each one apply event, plus at most one rate-limited
        // CGROUP_UNAVAILABLE.
        while successes < 2 {
            let ev = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            match ev.event {
                GovEventType::ApplySuccess => successes += 1,
                GovEventType::CgroupUnavailable => unavailable += 1,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(unavailable, 1);
        assert_eq!(gov.stats().cgroup_unavailable_events, 1);
        gov.stop();
    }

    #[test]
    fn group_policy_reports_cgroup_applied_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut caps = CgroupCaps::default();
        caps.set(CgroupCaps::CPU);
        caps.set(CgroupCaps::MEMORY);
        caps.set(CgroupCaps::PIDS);
        let driver = CgroupDriver::available_for_test(dir.path().join("base"), caps);

        let me = std::process::id() as i32;
        // Stand in for the controller files a real cgroupfs would provide.
        let pid_dir = driver.base_path().join(me.to_string());
        std::fs::create_dir_all(&pid_dir).unwrap();
        for file in ["cgroup.procs", "cpu.max", "memory.max", "pids.max"] {
            std::fs::write(pid_dir.join(file), "").unwrap();
        }

        let mut gov = ProcessGovernor::new(driver).unwrap();
        let (tx, rx) = mpsc::channel();
        gov.set_event_callback(Box::new(move |ev: &GovEvent| {
            let _ = tx.send(ev.clone());
        }));
        gov.start();

        let parsed = parse_gov_apply(&format!(
            "{{\"pid\":{me},\"group\":\"caged\",\"cpu\":{{\"max_pct\":50}},\
             \"mem\":{{\"max_bytes\":1048576}},\"pids\":{{\"max\":32}}}}"
        ));
        assert!(parsed.ok, "detail: {}", parsed.detail);
        assert!(gov.enqueue(parsed.msg));

        let ev = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ev.event, GovEventType::ApplySuccess);
        assert!(ev.applied.has(ApplyFields::CPU_MAX_PCT));
        assert!(ev.applied.has(ApplyFields::MEM_MAX_BYTES));
        assert!(ev.applied.has(ApplyFields::PIDS_MAX));
        // No per-PID primitives in the message, so nothing else is reported.
        assert!(!ev.applied.has(ApplyFields::CPU_AFFINITY));
        assert!(!ev.applied.has(ApplyFields::CPU_NICE));
        gov.stop();
    }

    #[test]
    fn reapplying_the_same_message_is_idempotent() {
        let (mut gov, rx) = governor_with_events();
        gov.start();

        let me = std::process::id() as i32;
        let parsed = parse_gov_apply(&format!(
            "{{\"pid\":{me},\"rlim\":{{\"core_soft\":0,\"core_hard\":0}}}}"
        ));
        assert!(parsed.ok);

        assert!(gov.enqueue(parsed.msg.clone()));
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(gov.enqueue(parsed.msg));
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(first.event, GovEventType::ApplySuccess);
        assert_eq!(second.event, GovEventType::ApplySuccess);
        assert_eq!(first.applied, second.applied);
        assert_eq!(gov.stats().messages_processed, 2);
        // Still one tracked rule for this pid.
        assert_eq!(gov.stats().rules_count, 1);
        gov.stop();
    }
}
