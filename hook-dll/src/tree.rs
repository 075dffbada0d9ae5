//! Process tree walk over a `(pid, parent_pid)` snapshot.

use std::collections::{HashSet, VecDeque};

/// Returns `root` followed by every process that descends from it.
///
/// Snapshots can contain parent links that loop back (pid reuse), so each pid
/// is visited once.
pub fn process_and_descendants(root: u32, entries: &[(u32, u32)]) -> Vec<u32> {
    let mut seen = HashSet::from([root]);
    let mut order = vec![root];
    let mut queue = VecDeque::from([root]);

    while let Some(parent) = queue.pop_front() {
        for &(pid, ppid) in entries {
            if ppid == parent && pid != parent && seen.insert(pid) {
                order.push(pid);
                queue.push_back(pid);
            }
        }
    }
    order
}
