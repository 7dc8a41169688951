use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use slotmap::DefaultKey;

#[derive(Eq, PartialEq)]
struct Entry {
    deadline: Instant,
    key: DefaultKey,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reverse so BinaryHeap (a max-heap) pops the earliest deadline first
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-loop min-heap of `(deadline, channel key)` pairs, polled once per
/// tick to drive idle and connect-attempt timeouts. A channel may have at
/// most one outstanding entry; re-arming pushes a fresh one rather than
/// mutating in place, and a stale pop (for a key whose deadline moved or
/// whose channel closed) is simply discarded by the caller.
#[derive(Default)]
pub struct TimerWheel {
    heap: BinaryHeap<Entry>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, key: DefaultKey, deadline: Instant) {
        self.heap.push(Entry { deadline, key });
    }

    /// Pops every entry due by `now`, in deadline order.
    pub fn drain_due(&mut self, now: Instant) -> Vec<DefaultKey> {
        let mut due = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            due.push(self.heap.pop().unwrap().key);
        }
        due
    }
}
