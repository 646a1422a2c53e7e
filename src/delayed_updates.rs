//! Delayed-update table (spec.md §3 "Delayed-update table", §4.D).
//!
//! A min-heap over `(wake_time_epoch_s, chunk_id)` plus a map from
//! `chunk_id` to the set of child ids collected for it. `track` always
//! records the child; it only enqueues a wake entry the first time a
//! given parent is tracked, so repeated `track` calls for the same
//! parent never produce duplicate heap entries (spec.md invariant 10).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::store::work_store::WorkStore;

struct WakeEntry {
    wake_at: i64,
    chunk_id: String,
}

impl PartialEq for WakeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at
    }
}
impl Eq for WakeEntry {}
impl PartialOrd for WakeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for WakeEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.wake_at.cmp(&other.wake_at)
    }
}

#[derive(Default)]
pub struct DelayedUpdateTable {
    heap: BinaryHeap<Reverse<WakeEntry>>,
    children: HashMap<String, HashSet<u64>>,
}

impl DelayedUpdateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `child_id` should trigger an update of `parent_chunk_id`
    /// once `now + delay_s` has elapsed. If `parent_chunk_id` is not
    /// already tracked, schedules its wake entry; otherwise only the
    /// child set grows.
    pub fn track(&mut self, parent_chunk_id: &str, child_id: u64, delay_s: i64, now: i64) {
        let first_time = !self.children.contains_key(parent_chunk_id);
        self.children
            .entry(parent_chunk_id.to_owned())
            .or_default()
            .insert(child_id);

        if first_time {
            self.heap.push(Reverse(WakeEntry {
                wake_at: now + delay_s,
                chunk_id: parent_chunk_id.to_owned(),
            }));
        }
    }

    /// Promotes every entry whose wake time has elapsed, invoking the
    /// atomic schedule-parent script on `store` for each collected child.
    pub async fn refresh(&mut self, store: &mut WorkStore, now: i64) {
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.wake_at > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            self.flush_parent(store, &entry.chunk_id).await;
        }
    }

    /// Drains every tracked parent unconditionally (used on shutdown).
    pub async fn purge(&mut self, store: &mut WorkStore) {
        let parents: Vec<String> = self.children.keys().cloned().collect();
        for parent in parents {
            self.flush_parent(store, &parent).await;
        }
        self.heap.clear();
    }

    async fn flush_parent(&mut self, store: &mut WorkStore, parent: &str) {
        let Some(child_ids) = self.children.remove(parent) else {
            return;
        };
        for child_id in child_ids {
            if let Err(e) = store
                .schedule_parent(parent, child_id, crate::config::NEEDS_UPDATE_TTL_SECS as i64)
                .await
            {
                tracing::warn!(parent, child_id, error = %e, "failed to schedule parent update");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_track_for_same_parent_schedules_once() {
        let mut table = DelayedUpdateTable::new();
        table.track("l1_3", 1, 5, 0);
        table.track("l1_3", 2, 5, 0);
        table.track("l1_3", 3, 5, 0);

        assert_eq!(table.heap.len(), 1);
        assert_eq!(
            table.children.get("l1_3").unwrap(),
            &HashSet::from([1, 2, 3])
        );
    }

    #[test]
    fn distinct_parents_each_get_a_wake_entry() {
        let mut table = DelayedUpdateTable::new();
        table.track("l1_3", 1, 5, 0);
        table.track("l1_4", 1, 5, 0);
        assert_eq!(table.heap.len(), 2);
    }
}
