use std::collections::VecDeque;

use crate::tracker::TaskTracker;

/// One FIFO per priority level.
#[derive(Debug)]
pub(crate) struct LevelQueues {
    levels: Vec<VecDeque<TaskTracker>>,
}

impl LevelQueues {
    pub fn new(priority_levels: usize) -> Self {
        Self {
            levels: (0..priority_levels).map(|_| VecDeque::new()).collect(),
        }
    }

    /// Enqueue at `level`, clamped to the highest configured level.
    pub fn push(&mut self, level: usize, tracker: TaskTracker) {
        let top = self.levels.len().saturating_sub(1);
        if let Some(queue) = self.levels.get_mut(level.min(top)) {
            queue.push_back(tracker);
        }
    }

    pub fn pop(&mut self, level: usize) -> Option<TaskTracker> {
        self.levels.get_mut(level)?.pop_front()
    }

    pub fn len(&self, level: usize) -> usize {
        self.levels.get(level).map_or(0, VecDeque::len)
    }

    pub fn depths(&self) -> Vec<usize> {
        self.levels.iter().map(VecDeque::len).collect()
    }

    pub fn total(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    /// Drop everything still waiting, returning the trackers.
    pub fn drain(&mut self) -> Vec<TaskTracker> {
        self.levels.iter_mut().flat_map(|q| q.drain(..)).collect()
    }
}
