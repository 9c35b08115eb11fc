//! Bounded in-memory store for named group policies and the PID-to-group map.
//!
//! Both tables are fixed-capacity slot arrays with least-recently-updated
//! eviction. When several entries share the oldest timestamp the entry in the
//! lowest slot index is evicted; tests rely on that tie-break staying stable.

use crate::gov::rule::{GovApplyMsg, ViolationAction, MAX_GROUP_ID_LEN};
use std::time::Instant;

pub const MAX_GROUPS: usize = 256;
pub const MAX_PID_GROUP_MAP: usize = 8192;

/// Merged per-group policy. Fields accumulate across upserts; the last writer
/// wins per field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupPolicy {
    pub group_id: String,
    pub last_update_ns: u64,

    pub cpu_max_pct: Option<u8>,
    pub cpu_quota_us: Option<u32>,
    pub cpu_period_us: Option<u32>,

    pub mem_max_bytes: Option<u64>,
    pub mem_high_bytes: Option<u64>,

    pub pids_max: Option<u32>,

    pub default_action: Option<ViolationAction>,
    pub apply_deadline_ms: Option<u32>,
}

impl GroupPolicy {
    pub fn has_any_policy(&self) -> bool {
        self.cpu_max_pct.is_some()
            || self.cpu_quota_us.is_some()
            || self.cpu_period_us.is_some()
            || self.mem_max_bytes.is_some()
            || self.mem_high_bytes.is_some()
            || self.pids_max.is_some()
            || self.default_action.is_some()
            || self.apply_deadline_ms.is_some()
    }

    fn merge_from(&mut self, msg: &GovApplyMsg) {
        if let Some(cpu) = &msg.cpu {
            if cpu.max_pct.is_some() {
                self.cpu_max_pct = cpu.max_pct;
            }
            if cpu.quota_us.is_some() {
                self.cpu_quota_us = cpu.quota_us;
            }
            if cpu.period_us.is_some() {
                self.cpu_period_us = cpu.period_us;
            }
        }
        if let Some(mem) = &msg.mem {
            if mem.max_bytes.is_some() {
                self.mem_max_bytes = mem.max_bytes;
            }
            if mem.high_bytes.is_some() {
                self.mem_high_bytes = mem.high_bytes;
            }
        }
        if let Some(pids) = &msg.pids {
            if pids.max.is_some() {
                self.pids_max = pids.max;
            }
        }
        if msg.action.is_some() {
            self.default_action = msg.action;
        }
        if let Some(t) = &msg.timeouts {
            if t.apply_deadline_ms.is_some() {
                self.apply_deadline_ms = t.apply_deadline_ms;
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub group_count: usize,
    pub pid_group_map_count: usize,
    pub group_evictions: u64,
    pub pidmap_evictions: u64,
}

#[derive(Debug, Clone)]
struct PidEntry {
    pid: i32,
    group_id: String,
    last_seen_ns: u64,
}

pub struct GroupPolicyStore {
    groups: Vec<Option<GroupPolicy>>,
    pid_map: Vec<Option<PidEntry>>,
    group_count: usize,
    pid_map_count: usize,
    group_evictions: u64,
    pidmap_evictions: u64,
    epoch: Instant,
    test_seq: Option<u64>,
}

impl Default for GroupPolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupPolicyStore {
    pub const TEST_TIME_INCREMENT: u64 = 1_000_000_000;

    pub fn new() -> Self {
        Self {
            groups: vec![None; MAX_GROUPS],
            pid_map: vec![None; MAX_PID_GROUP_MAP],
            group_count: 0,
            pid_map_count: 0,
            group_evictions: 0,
            pidmap_evictions: 0,
            epoch: Instant::now(),
            test_seq: None,
        }
    }

    /// Pin the clock to a fixed sequence value (any value, zero included) so
    /// eviction order is deterministic under test; `tick` then advances it
    /// explicitly. Production stores never pin and use the monotonic clock.
    pub fn set_time_for_test(&mut self, seq: u64) {
        self.test_seq = Some(seq);
    }

    pub fn tick(&mut self) {
        if let Some(seq) = &mut self.test_seq {
            *seq += Self::TEST_TIME_INCREMENT;
        }
    }

    fn now_ns(&self) -> u64 {
        match self.test_seq {
            Some(seq) => seq,
            None => self.epoch.elapsed().as_nanos() as u64,
        }
    }

    fn valid_group_id(id: &str) -> bool {
        !id.is_empty()
            && id.len() <= MAX_GROUP_ID_LEN
            && id.bytes().all(|b| (0x21..=0x7e).contains(&b))
    }

    /// Insert or merge a group policy. Returns false only on a malformed id.
    pub fn upsert_group(&mut self, group_id: &str, msg: &GovApplyMsg) -> bool {
        if !Self::valid_group_id(group_id) {
            return false;
        }
        let now = self.now_ns();

        if let Some(slot) = self
            .groups
            .iter_mut()
            .flatten()
            .find(|g| g.group_id == group_id)
        {
            slot.last_update_ns = now;
            slot.merge_from(msg);
            return true;
        }

        if self.group_count >= MAX_GROUPS {
            self.evict_oldest_group();
            self.group_evictions += 1;
        }

        let mut policy = GroupPolicy {
            group_id: group_id.to_string(),
            last_update_ns: now,
            ..Default::default()
        };
        policy.merge_from(msg);

        if let Some(free) = self.groups.iter_mut().find(|g| g.is_none()) {
            *free = Some(policy);
            self.group_count += 1;
            return true;
        }
        false
    }

    /// Attach a pid to a group, touching the entry if it already exists.
    pub fn map_pid_to_group(&mut self, pid: i32, group_id: &str) -> bool {
        if !Self::valid_group_id(group_id) {
            return false;
        }
        let now = self.now_ns();

        if let Some(entry) = self.pid_map.iter_mut().flatten().find(|e| e.pid == pid) {
            entry.group_id = group_id.to_string();
            entry.last_seen_ns = now;
            return true;
        }

        if self.pid_map_count >= MAX_PID_GROUP_MAP {
            self.evict_oldest_pid_entry();
            self.pidmap_evictions += 1;
        }

        if let Some(free) = self.pid_map.iter_mut().find(|e| e.is_none()) {
            *free = Some(PidEntry {
                pid,
                group_id: group_id.to_string(),
                last_seen_ns: now,
            });
            self.pid_map_count += 1;
            return true;
        }
        false
    }

    pub fn get_group(&self, group_id: &str) -> Option<&GroupPolicy> {
        self.groups
            .iter()
            .flatten()
            .find(|g| g.group_id == group_id)
    }

    pub fn get_group_for_pid(&self, pid: i32) -> Option<&str> {
        self.pid_map
            .iter()
            .flatten()
            .find(|e| e.pid == pid)
            .map(|e| e.group_id.as_str())
    }

    pub fn remove_pid(&mut self, pid: i32) {
        for slot in self.pid_map.iter_mut() {
            if slot.as_ref().is_some_and(|e| e.pid == pid) {
                *slot = None;
                self.pid_map_count = self.pid_map_count.saturating_sub(1);
                return;
            }
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            group_count: self.group_count,
            pid_group_map_count: self.pid_map_count,
            group_evictions: self.group_evictions,
            pidmap_evictions: self.pidmap_evictions,
        }
    }

    pub fn clear(&mut self) {
        self.groups = vec![None; MAX_GROUPS];
        self.pid_map = vec![None; MAX_PID_GROUP_MAP];
        self.group_count = 0;
        self.pid_map_count = 0;
        self.group_evictions = 0;
        self.pidmap_evictions = 0;
    }

    fn evict_oldest_group(&mut self) {
        let mut oldest_ns = u64::MAX;
        let mut oldest_idx = None;
        for (i, slot) in self.groups.iter().enumerate() {
            if let Some(g) = slot {
                if g.last_update_ns < oldest_ns {
                    oldest_ns = g.last_update_ns;
                    oldest_idx = Some(i);
                }
            }
        }
        if let Some(i) = oldest_idx {
            self.groups[i] = None;
            self.group_count = self.group_count.saturating_sub(1);
        }
    }

    fn evict_oldest_pid_entry(&mut self) {
        let mut oldest_ns = u64::MAX;
        let mut oldest_idx = None;
        for (i, slot) in self.pid_map.iter().enumerate() {
            if let Some(e) = slot {
                if e.last_seen_ns < oldest_ns {
                    oldest_ns = e.last_seen_ns;
                    oldest_idx = Some(i);
                }
            }
        }
        if let Some(i) = oldest_idx {
            self.pid_map[i] = None;
            self.pid_map_count = self.pid_map_count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gov::rule::{CpuPolicy, MemPolicy};

    fn msg_with_group(group: &str) -> GovApplyMsg {
        GovApplyMsg {
            pid: 1,
            group: Some(group.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn insert_and_lookup() {
        let mut store = GroupPolicyStore::new();
        store.set_time_for_test(1);
        assert!(store.upsert_group("alpha", &msg_with_group("alpha")));
        assert!(store.get_group("alpha").is_some());
        assert!(store.get_group("beta").is_none());
        assert_eq!(store.stats().group_count, 1);
    }

    #[test]
    fn test_clock_pins_at_zero() {
        let mut store = GroupPolicyStore::new();
        store.set_time_for_test(0);
        store.upsert_group("a", &msg_with_group("a"));
        assert_eq!(store.get_group("a").unwrap().last_update_ns, 0);
        store.tick();
        store.upsert_group("b", &msg_with_group("b"));
        assert_eq!(
            store.get_group("b").unwrap().last_update_ns,
            GroupPolicyStore::TEST_TIME_INCREMENT
        );
    }

    #[test]
    fn rejects_malformed_ids() {
        let mut store = GroupPolicyStore::new();
        assert!(!store.upsert_group("", &GovApplyMsg::default()));
        assert!(!store.upsert_group(&"g".repeat(33), &GovApplyMsg::default()));
        assert!(!store.upsert_group("has space", &GovApplyMsg::default()));
    }

    #[test]
    fn merge_is_last_writer_wins_per_field() {
        let mut store = GroupPolicyStore::new();
        store.set_time_for_test(1);

        let mut m1 = msg_with_group("g");
        m1.cpu = Some(CpuPolicy {
            max_pct: Some(50),
            ..Default::default()
        });
        m1.mem = Some(MemPolicy {
            max_bytes: Some(1024),
            ..Default::default()
        });
        assert!(store.upsert_group("g", &m1));

        store.tick();
        let mut m2 = msg_with_group("g");
        m2.cpu = Some(CpuPolicy {
            max_pct: Some(75),
            ..Default::default()
        });
        assert!(store.upsert_group("g", &m2));

        let g = store.get_group("g").unwrap();
        assert_eq!(g.cpu_max_pct, Some(75));
        // Untouched fields survive the second upsert.
        assert_eq!(g.mem_max_bytes, Some(1024));
        assert_eq!(store.stats().group_count, 1);
    }

    #[test]
    fn eviction_at_capacity_drops_the_oldest() {
        let mut store = GroupPolicyStore::new();
        store.set_time_for_test(1);

        for i in 0..=MAX_GROUPS {
            let name = format!("group_{i}");
            assert!(store.upsert_group(&name, &msg_with_group(&name)));
            store.tick();
        }

        let stats = store.stats();
        assert_eq!(stats.group_count, MAX_GROUPS);
        assert_eq!(stats.group_evictions, 1);
        assert!(store.get_group("group_0").is_none());
        assert!(store.get_group(&format!("group_{MAX_GROUPS}")).is_some());
    }

    #[test]
    fn eviction_tie_break_is_lowest_slot() {
        let mut store = GroupPolicyStore::new();
        // All entries share timestamp 1: the tie-break must evict slot 0.
        store.set_time_for_test(1);
        for i in 0..MAX_GROUPS {
            assert!(store.upsert_group(&format!("g{i}"), &msg_with_group("x")));
        }
        assert!(store.upsert_group("overflow", &msg_with_group("x")));
        assert!(store.get_group("g0").is_none());
        assert!(store.get_group("g1").is_some());
    }

    #[test]
    fn touch_protects_from_eviction() {
        let mut store = GroupPolicyStore::new();
        store.set_time_for_test(1);
        for i in 0..MAX_GROUPS {
            store.upsert_group(&format!("g{i}"), &msg_with_group("x"));
            store.tick();
        }
        // Refresh g0 so g1 becomes the oldest.
        store.upsert_group("g0", &msg_with_group("x"));
        store.tick();
        store.upsert_group("fresh", &msg_with_group("x"));
        assert!(store.get_group("g0").is_some());
        assert!(store.get_group("g1").is_none());
    }

    #[test]
    fn pid_map_insert_touch_and_evict() {
        let mut store = GroupPolicyStore::new();
        store.set_time_for_test(1);

        assert!(store.map_pid_to_group(100, "a"));
        assert_eq!(store.get_group_for_pid(100), Some("a"));
        store.tick();
        // Re-mapping the same pid replaces the group without growing the map.
        assert!(store.map_pid_to_group(100, "b"));
        assert_eq!(store.get_group_for_pid(100), Some("b"));
        assert_eq!(store.stats().pid_group_map_count, 1);

        for pid in 0..MAX_PID_GROUP_MAP as i32 {
            store.map_pid_to_group(1000 + pid, "g");
            store.tick();
        }
        let stats = store.stats();
        assert_eq!(stats.pid_group_map_count, MAX_PID_GROUP_MAP);
        assert_eq!(stats.pidmap_evictions, 1);
        assert_eq!(store.get_group_for_pid(100), None);
    }

    #[test]
    fn remove_pid_frees_a_slot() {
        let mut store = GroupPolicyStore::new();
        store.set_time_for_test(1);
        store.map_pid_to_group(7, "g");
        store.remove_pid(7);
        assert_eq!(store.get_group_for_pid(7), None);
        assert_eq!(store.stats().pid_group_map_count, 0);
    }

    #[test]
    fn clear_resets_counts_and_evictions() {
        let mut store = GroupPolicyStore::new();
        store.set_time_for_test(1);
        store.upsert_group("g", &msg_with_group("g"));
        store.map_pid_to_group(1, "g");
        store.clear();
        let stats = store.stats();
        assert_eq!(stats.group_count, 0);
        assert_eq!(stats.pid_group_map_count, 0);
        assert_eq!(stats.group_evictions, 0);
    }
}
