use chrono::NaiveDateTime;
use serde::Serialize;

use crate::task::Task;

/// Counts over the full, unfiltered task list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub total: usize,
    pub pending: usize,
    pub completed: usize,
    pub overdue: usize,
}

impl Stats {
    #[tracing::instrument(skip(tasks, now), fields(count = tasks.len()))]
    pub fn compute(tasks: &[Task], now: NaiveDateTime) -> Self {
        let completed = tasks.iter().filter(|t| t.completed).count();
        let overdue = tasks.iter().filter(|t| t.is_overdue(now)).count();
        Self {
            total: tasks.len(),
            pending: tasks.len() - completed,
            completed,
            overdue,
        }
    }
}
