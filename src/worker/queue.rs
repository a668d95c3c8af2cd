//! Priority task queue: priority descending, FIFO within a priority.

use std::collections::VecDeque;

use super::task::Task;
use crate::wire::TaskId;

#[derive(Debug, Default)]
pub struct TaskQueue {
    entries: VecDeque<Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert behind every task of higher or equal rank. Requeued tasks keep
    /// their original sequence number and so land back in their old slot.
    pub fn push(&mut self, task: Task) {
        let at = self
            .entries
            .iter()
            .position(|queued| {
                queued.priority < task.priority
                    || (queued.priority == task.priority && queued.seq > task.seq)
            })
            .unwrap_or(self.entries.len());
        self.entries.insert(at, task);
    }

    pub fn pop(&mut self) -> Option<Task> {
        self.entries.pop_front()
    }

    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        let at = self.entries.iter().position(|t| t.id == id)?;
        self.entries.remove(at)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.entries.iter().any(|t| t.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Task> + '_ {
        self.entries.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TabularResult;
    use crate::wire::{OperationPayload, Priority, StatisticsPayload, UnitMessage};
    use proptest::prelude::*;

    const PRIORITIES: [Priority; 4] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Critical,
    ];

    fn task(priority: Priority, seq: u64) -> Task {
        let message = UnitMessage::new(
            TaskId::new(),
            OperationPayload::Statistics(StatisticsPayload {
                data: TabularResult::default(),
                columns: None,
            }),
            priority,
        );
        Task::new(message, seq, 0)
    }

    #[test]
    fn higher_priority_first_then_fifo() {
        let mut queue = TaskQueue::new();
        queue.push(task(Priority::Low, 0));
        queue.push(task(Priority::Normal, 1));
        queue.push(task(Priority::High, 2));
        queue.push(task(Priority::Normal, 3));

        let order: Vec<_> = std::iter::from_fn(|| queue.pop())
            .map(|t| (t.priority, t.seq))
            .collect();
        assert_eq!(
            order,
            vec![
                (Priority::High, 2),
                (Priority::Normal, 1),
                (Priority::Normal, 3),
                (Priority::Low, 0),
            ]
        );
    }

    #[test]
    fn requeued_task_returns_to_its_slot() {
        let mut queue = TaskQueue::new();
        let first = task(Priority::Normal, 0);
        queue.push(task(Priority::Normal, 1));
        queue.push(task(Priority::Normal, 2));
        queue.push(first);
        assert_eq!(queue.pop().map(|t| t.seq), Some(0));
    }

    #[test]
    fn remove_by_id() {
        let mut queue = TaskQueue::new();
        let t = task(Priority::Low, 0);
        let id = t.id;
        queue.push(t);
        queue.push(task(Priority::Low, 1));
        assert!(queue.contains(id));
        assert_eq!(queue.remove(id).map(|t| t.id), Some(id));
        assert!(!queue.contains(id));
        assert_eq!(queue.len(), 1);
        assert!(queue.remove(id).is_none());
    }

    proptest! {
        #[test]
        fn pops_in_priority_then_admission_order(prios in proptest::collection::vec(0..4usize, 0..64)) {
            let mut queue = TaskQueue::new();
            let mut expected: Vec<(Priority, u64)> = Vec::new();
            for (seq, p) in prios.into_iter().enumerate() {
                let priority = PRIORITIES[p];
                queue.push(task(priority, seq as u64));
                expected.push((priority, seq as u64));
            }
            expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

            let actual: Vec<_> = std::iter::from_fn(|| queue.pop())
                .map(|t| (t.priority, t.seq))
                .collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
