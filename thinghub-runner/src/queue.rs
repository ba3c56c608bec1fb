//! Task priority queue
//!
//! Orders undispatched tasks by status priority (`InProgress > Sent > Queued`),
//! then by creation time. The queue takes no locks: it is owned by exactly one
//! event loop.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use thinghub_core::domain::TaskId;
use thinghub_core::domain::task::Task;

#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: BinaryHeap<Entry>,
}

#[derive(Debug)]
struct Entry(Task);

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .status
            .priority()
            .cmp(&other.0.status.priority())
            .then_with(|| other.0.created_at.cmp(&self.0.created_at))
            .then_with(|| other.0.task_id.cmp(&self.0.task_id))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: Task) {
        self.heap.push(Entry(task));
    }

    /// Removes and returns the highest priority task
    pub fn pop(&mut self) -> Option<Task> {
        self.heap.pop().map(|e| e.0)
    }

    pub fn peek(&self) -> Option<&Task> {
        self.heap.peek().map(|e| &e.0)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Removes a task by id, O(n)
    pub fn remove(&mut self, task_id: TaskId) -> Option<Task> {
        self.remove_where(|t| t.task_id == task_id).into_iter().next()
    }

    /// Removes every task matching `pred` and returns them
    pub fn remove_where(&mut self, mut pred: impl FnMut(&Task) -> bool) -> Vec<Task> {
        let (removed, kept): (Vec<Entry>, Vec<Entry>) =
            std::mem::take(&mut self.heap).into_iter().partition(|e| pred(&e.0));
        self.heap = kept.into();
        removed.into_iter().map(|e| e.0).collect()
    }

    /// Snapshot of the queued tasks in pop order
    pub fn tasks(&self) -> Vec<Task> {
        let mut entries: Vec<&Entry> = self.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| e.0.clone()).collect()
    }
}
