//! Earliest-deadline-first ready queue.

use crate::invariant_ppt::{assert_invariant, SCHED_TASK_LIVE};
use crate::rbtree::{NodeRef, RbTree};

/// Handle of a scheduled task.
pub type TaskRef = NodeRef;

/// `a` is strictly earlier than `b` on the wrapping 32-bit timeline.
pub fn ts_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Tasks ordered by timestamp, with the earliest one cached.
#[derive(Debug)]
pub struct Scheduler<T> {
    tree: RbTree<u32, T>,
    first: Option<TaskRef>,
    ts: u32,
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Self {
            tree: RbTree::new(),
            first: None,
            ts: 0,
        }
    }

    /// Queue `task` to run at `ts`. Tasks with equal timestamps run in the
    /// order they were queued.
    pub fn put(&mut self, task: T, ts: u32) -> TaskRef {
        let mut leftmost = true;
        let (parent, side) = self.tree.locate(|k, _| {
            let left = ts_before(ts, *k);
            leftmost &= left;
            left
        });
        let t = self.tree.insert(parent, side, ts, task);
        if leftmost {
            self.first = Some(t);
        }
        t
    }

    /// Pop the earliest task and advance the scheduler time to it.
    pub fn get(&mut self) -> Option<T> {
        let t = self.first?;
        let detached = self.tree.delete(t);
        self.ts = detached.key;
        self.first = detached.next;
        Some(detached.value)
    }

    /// Remove a queued task.
    pub fn cancel(&mut self, t: TaskRef) -> T {
        assert_invariant(
            SCHED_TASK_LIVE,
            self.tree.contains(t),
            "cancel of a task that is not scheduled",
            Some("Scheduler::cancel"),
        );
        let detached = self.tree.delete(t);
        if self.first == Some(t) {
            self.first = detached.next;
        }
        detached.value
    }

    /// Earliest task and its timestamp.
    pub fn peek(&self) -> Option<(u32, &T)> {
        self.first.map(|t| (*self.tree.key(t), self.tree.value(t)))
    }

    pub fn contains(&self, t: TaskRef) -> bool {
        self.tree.contains(t)
    }

    /// Timestamp of the last task handed out by [`Scheduler::get`].
    pub fn timestamp(&self) -> u32 {
        self.ts
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}
