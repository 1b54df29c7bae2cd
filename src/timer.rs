// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Idle-connection reaping via a tombstoned min-heap.
//!
//! Each armed connection gets a [`TimerEntry`] pushed onto a shared min-heap
//! ordered by deadline. Re-arming a connection never touches the heap
//! directly: it flips the old entry's tombstone and pushes a fresh one,
//! leaving the stale entry to be skipped on its eventual pop. This mirrors a
//! `std::priority_queue` with lazy deletion rather than a heap supporting
//! arbitrary removal.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Shared flag marking a [`TimerEntry`] as logically deleted.
///
/// A connection holds a clone of its own current entry's tombstone so it can
/// defuse that entry without touching the heap.
pub type Tombstone = Arc<AtomicBool>;

/// Creates a fresh, live tombstone flag.
pub fn new_tombstone() -> Tombstone {
    Arc::new(AtomicBool::new(false))
}

/// One pending deadline. `owner` identifies the connection to reap; it is
/// the connection's slot in the dispatcher's registry, not a strong
/// reference, so the timer set never has to know how a connection is
/// destroyed, only that it should be told to go away.
struct TimerEntry {
    deadline: Instant,
    tombstone: Tombstone,
    owner: usize,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    /// Reversed so that `BinaryHeap`, normally a max-heap, surfaces the
    /// soonest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

/// Min-heap of pending idle deadlines, guarded by a single mutex.
pub struct TimerSet {
    heap: Mutex<BinaryHeap<TimerEntry>>,
    idle_timeout: Duration,
}

impl TimerSet {
    /// Creates an empty timer set with the given idle window.
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            idle_timeout,
        }
    }

    /// Arms a fresh deadline for `owner`, returning the tombstone the caller
    /// must store on the connection and flip before the connection is next
    /// destroyed or re-armed.
    pub fn arm(&self, owner: usize) -> Tombstone {
        let tombstone = new_tombstone();
        let entry = TimerEntry {
            deadline: Instant::now() + self.idle_timeout,
            tombstone: tombstone.clone(),
            owner,
        };
        self.heap.lock().unwrap().push(entry);
        tombstone
    }

    /// Pops every tombstoned or expired entry from the top of the heap,
    /// invoking `reap` with the owning slot for each entry that was live
    /// (not already tombstoned) at expiry. `reap` is responsible for
    /// actually closing the connection and must itself flip the tombstone
    /// it is handed, since the entry has already been removed from the heap.
    pub fn reap_expired<F: FnMut(usize)>(&self, mut reap: F) {
        let now = Instant::now();
        let mut heap = self.heap.lock().unwrap();
        while let Some(top) = heap.peek() {
            if top.tombstone.load(AtomicOrdering::Acquire) {
                heap.pop();
                continue;
            }
            if top.deadline > now {
                break;
            }
            let entry = heap.pop().expect("peeked entry must be present");
            entry.tombstone.store(true, AtomicOrdering::Release);
            reap(entry.owner);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reaps_in_deadline_order() {
        let timers = TimerSet::new(Duration::from_millis(0));
        let t_a = timers.arm(1);
        std::thread::sleep(Duration::from_millis(5));
        let _t_b = timers.arm(2);

        let mut reaped = Vec::new();
        timers.reap_expired(|owner| reaped.push(owner));
        assert_eq!(reaped, vec![1, 2]);
        assert!(t_a.load(AtomicOrdering::Acquire));
    }

    #[test]
    fn tombstoned_entry_is_skipped_without_reaping() {
        let timers = TimerSet::new(Duration::from_millis(0));
        let stale = timers.arm(1);
        stale.store(true, AtomicOrdering::Release);
        timers.arm(1);

        let mut reaped = Vec::new();
        timers.reap_expired(|owner| reaped.push(owner));
        assert_eq!(reaped, vec![1]);
    }

    #[test]
    fn future_deadline_is_not_reaped() {
        let timers = TimerSet::new(Duration::from_secs(60));
        timers.arm(1);
        let mut reaped = Vec::new();
        timers.reap_expired(|owner| reaped.push(owner));
        assert!(reaped.is_empty());
    }
}
